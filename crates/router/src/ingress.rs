use std::sync::Arc;

use {
    serde_json::Value,
    tracing::{debug, warn},
};

use switchboard_protocol::{ErrorCode, ErrorShape};

use crate::{
    ConnectionData,
    connection::Connection,
    context::write_wire_error,
    hooks::{RouterErrorEvent, UnhandledMessage},
    service::RouterShared,
};

/// The per-frame ingress pipeline: size guard → parse → type extraction →
/// registry lookup → pending guard → validate/dispatch. Failures route to
/// the error sink; none of them close the connection.
pub(crate) async fn handle_frame<D: ConnectionData>(
    shared: &Arc<RouterShared<D>>,
    conn: &Arc<Connection<D>>,
    raw: &str,
) {
    if raw.len() > shared.config.max_payload_bytes {
        warn!(client_id = %conn.client_id(), size = raw.len(), "frame exceeds payload cap");
        let shape = ErrorShape::from_code(ErrorCode::ResourceExhausted, "frame too large")
            .with_context(serde_json::json!({
                "kind": "payload-too-large",
                "maxBytes": shared.config.max_payload_bytes,
            }));
        sink(shared, conn, None, None, shape).await;
        return;
    }

    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            let shape =
                ErrorShape::from_code(ErrorCode::InvalidArgument, format!("malformed frame: {err}"))
                    .with_context(serde_json::json!({"kind": "parse"}));
            sink(shared, conn, None, None, shape).await;
            return;
        },
    };

    // Mirror the inbound correlation id on any error reply.
    let correlation = value
        .get("meta")
        .and_then(|meta| meta.get("correlationId"))
        .and_then(Value::as_str)
        .map(String::from);

    let Some(message_type) = value.get("type").and_then(Value::as_str).map(String::from) else {
        let shape = ErrorShape::from_code(
            ErrorCode::InvalidArgument,
            "message type is missing or not a string",
        );
        sink(shared, conn, correlation, None, shape).await;
        return;
    };

    let Some(entry) = shared.registry.lookup(&message_type) else {
        let handled = shared.observers.emit_unhandled(UnhandledMessage {
            client_id: conn.client_id().to_string(),
            envelope: value,
        });
        if !handled {
            let shape = ErrorShape::from_code(
                ErrorCode::Unimplemented,
                format!("no handler registered for \"{message_type}\""),
            );
            sink(shared, conn, correlation, Some(message_type), shape).await;
        }
        return;
    };
    let kind = entry.kind;
    let invoke = entry.invoke.clone();
    let route_middleware = entry.middleware.clone();

    if conn.pending_incoming() >= shared.config.max_pending_per_connection {
        let shape = ErrorShape::from_code(
            ErrorCode::ResourceExhausted,
            "too many in-flight messages on this connection",
        )
        .with_context(serde_json::json!({
            "maxPending": shared.config.max_pending_per_connection,
        }));
        sink(shared, conn, correlation, Some(message_type), shape).await;
        return;
    }

    debug!(client_id = %conn.client_id(), message_type = %message_type, kind = ?kind, "dispatching");
    conn.begin_frame();
    let chain: Vec<_> = shared
        .global_middleware
        .iter()
        .chain(route_middleware.iter())
        .cloned()
        .collect();
    let result = invoke(value, conn.clone(), shared.clone(), chain).await;
    conn.end_frame();

    if let Err(shape) = result {
        sink(shared, conn, correlation, Some(message_type), shape).await;
    }
}

/// The error sink: write an `"ERROR"` frame back (correlated when the
/// inbound frame carried a correlation id) and fire the error hooks.
async fn sink<D: ConnectionData>(
    shared: &Arc<RouterShared<D>>,
    conn: &Arc<Connection<D>>,
    correlation: Option<String>,
    message_type: Option<String>,
    shape: ErrorShape,
) {
    write_wire_error(conn, &shape, correlation.as_deref()).await;
    shared.observers.emit_error(&RouterErrorEvent {
        client_id: conn.client_id().to_string(),
        message_type,
        error: shape,
    });
}
