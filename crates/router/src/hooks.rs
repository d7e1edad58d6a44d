use std::{panic::AssertUnwindSafe, sync::Arc};

use {switchboard_protocol::ErrorShape, tracing::warn};

// ── Hook payloads ────────────────────────────────────────────────────────────

/// What the router error hook observes.
#[derive(Debug, Clone)]
pub struct RouterErrorEvent {
    pub client_id: String,
    pub message_type: Option<String>,
    pub error: ErrorShape,
}

/// A frame whose type has no registered handler.
#[derive(Debug, Clone)]
pub struct UnhandledMessage {
    pub client_id: String,
    pub envelope: serde_json::Value,
}

pub(crate) type ErrorHook = Arc<dyn Fn(&RouterErrorEvent) + Send + Sync>;
pub(crate) type UnhandledHook = Arc<dyn Fn(UnhandledMessage) + Send + Sync>;
pub(crate) type ConnectionCloseHook = Arc<dyn Fn(&str) + Send + Sync>;

// ── Observer registry ────────────────────────────────────────────────────────

/// Observer callbacks must never throw into the pipeline; a panic inside one
/// is caught and logged.
#[derive(Default, Clone)]
pub(crate) struct Observers {
    pub error_hooks: Vec<ErrorHook>,
    pub unhandled: Option<UnhandledHook>,
    pub connection_close: Option<ConnectionCloseHook>,
}

impl Observers {
    pub fn emit_error(&self, event: &RouterErrorEvent) {
        for hook in &self.error_hooks {
            guard(|| hook(event), "onError");
        }
    }

    pub fn emit_unhandled(&self, message: UnhandledMessage) -> bool {
        match &self.unhandled {
            Some(hook) => {
                guard(|| hook(message), "onUnhandled");
                true
            },
            None => false,
        }
    }

    pub fn emit_connection_close(&self, client_id: &str) {
        if let Some(hook) = &self.connection_close {
            guard(|| hook(client_id), "onConnectionClose");
        }
    }
}

fn guard(f: impl FnOnce(), hook_name: &str) {
    if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(hook = hook_name, "observer panicked, ignoring");
    }
}
