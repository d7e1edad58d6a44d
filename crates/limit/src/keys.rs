//! Canned key-derivation functions.
//!
//! Key derivation is caller-owned; these cover the common shapes. Unknown
//! identities share the `"anon"` bucket rather than escaping limiting.

/// What a key function gets to see about the message being limited.
#[derive(Debug, Clone, Copy)]
pub struct RateKeyContext<'a> {
    pub message_type: &'a str,
    pub client_id: Option<&'a str>,
    pub ip: Option<&'a str>,
}

const ANON: &str = "anon";

/// One bucket per authenticated user.
pub fn key_per_user(ctx: &RateKeyContext<'_>) -> String {
    format!("user:{}", ctx.client_id.unwrap_or(ANON))
}

/// One bucket per user per message type.
pub fn key_per_user_per_type(ctx: &RateKeyContext<'_>) -> String {
    format!("user:{}:type:{}", ctx.client_id.unwrap_or(ANON), ctx.message_type)
}

/// Per user when identified, falling back to per IP, then to the shared
/// anonymous bucket; always scoped by message type.
pub fn key_per_user_or_ip_per_type(ctx: &RateKeyContext<'_>) -> String {
    match (ctx.client_id, ctx.ip) {
        (Some(user), _) => format!("user:{user}:type:{}", ctx.message_type),
        (None, Some(ip)) => format!("ip:{ip}:type:{}", ctx.message_type),
        (None, None) => format!("{ANON}:type:{}", ctx.message_type),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(client_id: Option<&'a str>, ip: Option<&'a str>) -> RateKeyContext<'a> {
        RateKeyContext {
            message_type: "SEND_MESSAGE",
            client_id,
            ip,
        }
    }

    #[test]
    fn per_user_falls_back_to_anon() {
        assert_eq!(key_per_user(&ctx(Some("u1"), None)), "user:u1");
        assert_eq!(key_per_user(&ctx(None, None)), "user:anon");
    }

    #[test]
    fn per_user_per_type_scopes_by_type() {
        assert_eq!(
            key_per_user_per_type(&ctx(Some("u1"), None)),
            "user:u1:type:SEND_MESSAGE"
        );
    }

    #[test]
    fn user_or_ip_prefers_user() {
        assert_eq!(
            key_per_user_or_ip_per_type(&ctx(Some("u1"), Some("10.0.0.1"))),
            "user:u1:type:SEND_MESSAGE"
        );
        assert_eq!(
            key_per_user_or_ip_per_type(&ctx(None, Some("10.0.0.1"))),
            "ip:10.0.0.1:type:SEND_MESSAGE"
        );
        assert_eq!(
            key_per_user_or_ip_per_type(&ctx(None, None)),
            "anon:type:SEND_MESSAGE"
        );
    }
}
