use std::{marker::PhantomData, sync::Arc};

use {
    serde::{Deserialize, Serialize, de::DeserializeOwned},
    serde_json::Value,
};

use crate::envelope::{Envelope, Meta};

// ── Issues ───────────────────────────────────────────────────────────────────

/// One validation finding, anchored to a path in the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub path: String,
    pub message: String,
}

impl Issue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Issue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

// ── Message schema ───────────────────────────────────────────────────────────

type Refinement<P> = Arc<dyn Fn(&P) -> Result<(), Vec<Issue>> + Send + Sync>;

/// A typed message descriptor: the `type` literal, the payload shape `P`,
/// and per-schema options. Payload strictness beyond shape is the
/// application's business (`#[serde(deny_unknown_fields)]` on `P`), and an
/// optional refinement hook covers cross-field rules.
pub struct MessageSchema<P> {
    message_type: &'static str,
    has_payload: bool,
    validate_outgoing: bool,
    refine: Option<Refinement<P>>,
    _payload: PhantomData<fn() -> P>,
}

impl<P> Clone for MessageSchema<P> {
    fn clone(&self) -> Self {
        Self {
            message_type: self.message_type,
            has_payload: self.has_payload,
            validate_outgoing: self.validate_outgoing,
            refine: self.refine.clone(),
            _payload: PhantomData,
        }
    }
}

impl<P> std::fmt::Debug for MessageSchema<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSchema")
            .field("type", &self.message_type)
            .field("has_payload", &self.has_payload)
            .finish()
    }
}

impl MessageSchema<()> {
    /// A schema for a message that declares no payload.
    pub fn without_payload(message_type: &'static str) -> Self {
        Self {
            message_type,
            has_payload: false,
            validate_outgoing: true,
            refine: None,
            _payload: PhantomData,
        }
    }
}

impl<P> MessageSchema<P> {
    pub fn new(message_type: &'static str) -> Self {
        Self {
            message_type,
            has_payload: true,
            validate_outgoing: true,
            refine: None,
            _payload: PhantomData,
        }
    }

    /// Disable outgoing validation for this schema (hot paths).
    #[must_use]
    pub fn skip_outgoing_validation(mut self) -> Self {
        self.validate_outgoing = false;
        self
    }

    /// Attach a refinement hook that runs after shape validation.
    #[must_use]
    pub fn refine(mut self, f: impl Fn(&P) -> Result<(), Vec<Issue>> + Send + Sync + 'static) -> Self {
        self.refine = Some(Arc::new(f));
        self
    }

    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    pub fn has_payload(&self) -> bool {
        self.has_payload
    }

    pub fn validate_outgoing(&self) -> bool {
        self.validate_outgoing
    }
}

impl<P: DeserializeOwned> MessageSchema<P> {
    /// Validate a raw JSON value against this schema.
    ///
    /// Envelopes are strict objects: only `type`, `meta`, and `payload` are
    /// legal keys, `type` must equal this schema's literal, and `payload`
    /// must be present iff the schema declares one.
    pub fn safe_parse(&self, value: &Value) -> Result<Envelope<P>, Vec<Issue>> {
        let mut issues = Vec::new();

        let Some(object) = value.as_object() else {
            return Err(vec![Issue::new("", "message must be a JSON object")]);
        };

        for key in object.keys() {
            if !matches!(key.as_str(), "type" | "meta" | "payload") {
                issues.push(Issue::new(key.clone(), "unknown envelope key"));
            }
        }

        match object.get("type").and_then(Value::as_str) {
            Some(t) if t == self.message_type => {},
            Some(t) => issues.push(Issue::new(
                "type",
                format!("expected \"{}\", got \"{t}\"", self.message_type),
            )),
            None => issues.push(Issue::new("type", "missing or not a string")),
        }

        let meta = match object.get("meta") {
            None => Meta::default(),
            Some(raw) if raw.is_object() => match serde_json::from_value::<Meta>(raw.clone()) {
                Ok(meta) => meta,
                Err(err) => {
                    issues.push(Issue::new("meta", err.to_string()));
                    Meta::default()
                },
            },
            Some(_) => {
                issues.push(Issue::new("meta", "must be an object"));
                Meta::default()
            },
        };

        let payload = match (self.has_payload, object.get("payload")) {
            (true, Some(raw)) => match serde_json::from_value::<P>(raw.clone()) {
                Ok(payload) => Some(payload),
                Err(err) => {
                    issues.push(Issue::new("payload", err.to_string()));
                    None
                },
            },
            (true, None) => {
                issues.push(Issue::new("payload", "missing required payload"));
                None
            },
            (false, Some(_)) => {
                issues.push(Issue::new("payload", "schema declares no payload"));
                None
            },
            // Payload-less schemas use the unit payload type, which
            // deserializes from null; typed consumers always get a value.
            (false, None) => serde_json::from_value::<P>(Value::Null).ok(),
        };

        if let (Some(refine), Some(payload)) = (&self.refine, &payload)
            && let Err(mut refinement_issues) = refine(payload)
        {
            issues.append(&mut refinement_issues);
        }

        if !issues.is_empty() {
            return Err(issues);
        }

        Ok(Envelope {
            message_type: self.message_type.to_string(),
            meta,
            payload,
        })
    }
}

impl<P: Serialize + DeserializeOwned> MessageSchema<P> {
    /// Build a wire message of this schema's type.
    pub fn message(&self, payload: P, meta: Meta) -> Envelope<P> {
        Envelope::new(self.message_type, meta, self.has_payload.then_some(payload))
    }
}

// ── RPC schema ───────────────────────────────────────────────────────────────

/// A request schema paired with its response descriptor.
#[derive(Debug, Clone)]
pub struct RpcSchema<P, R> {
    pub request: MessageSchema<P>,
    pub response: MessageSchema<R>,
}

impl<P, R> RpcSchema<P, R> {
    pub fn new(request_type: &'static str, response_type: &'static str) -> Self {
        Self {
            request: MessageSchema::new(request_type),
            response: MessageSchema::new(response_type),
        }
    }

    pub fn request_type(&self) -> &'static str {
        self.request.message_type()
    }

    pub fn response_type(&self) -> &'static str {
        self.response.message_type()
    }
}
