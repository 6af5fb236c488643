//! Per-message handling context, passed explicitly to every handler.

use std::sync::Mutex;

use crate::transport::{HeaderInfo, TransportMessage, WorkerControl};

/// Read-only view of the envelope currently being handled, plus the worker
/// control surface and an outgoing-header buffer. One context exists per
/// received envelope; handlers on other threads never share it implicitly,
/// so headers set here cannot leak into another message's handling.
#[derive(Default)]
pub struct MessageContext {
    message_id: String,
    id_for_correlation: String,
    correlation_id: Option<String>,
    return_address: String,
    headers: Vec<HeaderInfo>,
    outgoing_headers: Mutex<Vec<HeaderInfo>>,
    control: Option<WorkerControl>,
}

impl MessageContext {
    /// A context with no incoming envelope, for dispatching outside the
    /// transport (tests, local invocation).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_envelope(envelope: &TransportMessage, control: &WorkerControl) -> Self {
        Self {
            message_id: envelope.id.clone(),
            id_for_correlation: envelope
                .id_for_correlation()
                .unwrap_or(&envelope.id)
                .to_string(),
            correlation_id: envelope.correlation_id.clone(),
            return_address: envelope.return_address.clone(),
            headers: envelope.headers.clone(),
            outgoing_headers: Mutex::new(Vec::new()),
            control: Some(control.clone()),
        }
    }

    /// The id of the envelope being handled, unique per send attempt.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// The identity that stays stable across redeliveries; what replies
    /// correlate to.
    pub fn id_for_correlation(&self) -> &str {
        &self.id_for_correlation
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// The queue replies go to.
    pub fn return_address(&self) -> &str {
        &self.return_address
    }

    pub fn headers(&self) -> &[HeaderInfo] {
        &self.headers
    }

    /// Look up the first incoming header with the given key.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.key == key)
            .map(|h| h.value.as_str())
    }

    /// Stamp a header onto outbound envelopes produced while handling this
    /// message. The buffer lives and dies with the context.
    pub fn set_outgoing_header(&self, key: impl Into<String>, value: impl Into<String>) {
        self.outgoing_headers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(HeaderInfo::new(key, value));
    }

    pub fn outgoing_headers(&self) -> Vec<HeaderInfo> {
        self.outgoing_headers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Ask the transport to roll back the current message and redeliver it
    /// later, without counting a failure. No-op outside the transport.
    pub fn abort_handling_current_message(&self) {
        if let Some(control) = &self.control {
            control.abort_handling_current_message();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MessageIntent;

    #[test]
    fn context_snapshots_the_envelope() {
        let mut envelope = TransportMessage::new(MessageIntent::Send, Vec::new());
        envelope.id = "m1".to_string();
        envelope.correlation_id = Some("c1".to_string());
        envelope.return_address = "sender".to_string();
        envelope.set_header("tenant", "acme");

        let control = WorkerControl::new();
        let ctx = MessageContext::from_envelope(&envelope, &control);

        assert_eq!(ctx.message_id(), "m1");
        // Falls back to the envelope id when no stable identity was stamped.
        assert_eq!(ctx.id_for_correlation(), "m1");
        assert_eq!(ctx.correlation_id(), Some("c1"));
        assert_eq!(ctx.return_address(), "sender");
        assert_eq!(ctx.header("tenant"), Some("acme"));

        ctx.abort_handling_current_message();
        assert!(control.abort_requested());
    }

    #[test]
    fn outgoing_headers_accumulate_per_context() {
        let ctx = MessageContext::empty();
        assert!(ctx.outgoing_headers().is_empty());

        ctx.set_outgoing_header("tenant", "acme");
        ctx.set_outgoing_header("tenant", "globex");

        let headers = ctx.outgoing_headers();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].value, "acme");
        assert_eq!(headers[1].value, "globex");
    }
}
