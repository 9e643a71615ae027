// JSON-RPC session: request/response correlation over a peer transport.
// Numan Thabit 2026

use std::{collections::VecDeque, sync::Arc};

use ahash::AHashMap;
use bytes::Bytes;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    error::NetError,
    metrics::Metrics,
    peer::PeerId,
    transport::Transport,
};

/// Handle for one outbound call awaiting completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(u64);

/// Handle for one inbound method invocation awaiting a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvocationId(u64);

/// How an outbound call ended. Exactly one outcome fires per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// The remote end answered with a result.
    Result(Value),
    /// The remote end answered with an error value.
    Error(Value),
    /// The call was cancelled locally before an answer arrived.
    Cancelled,
}

/// Events surfaced by [`JsonrpcSession::poll_event`].
#[derive(Debug)]
pub enum JsonrpcEvent {
    /// An inbound request expecting a response via
    /// [`JsonrpcSession::respond`] / [`JsonrpcSession::respond_error`].
    MethodCall {
        method: String,
        params: Value,
        invocation: InvocationId,
        from: PeerId,
    },
    /// An inbound request with a null id: no response is expected.
    Notification {
        method: String,
        params: Value,
        from: PeerId,
    },
    /// An outbound call completed.
    Completed { call: CallId, outcome: CallOutcome },
}

struct PendingIn {
    wire_id: Value,
    from: PeerId,
}

/// One JSON-RPC endpoint multiplexing calls over peer transports.
///
/// Wire messages are single JSON objects per frame: `{id, method, params}`
/// requests and `{id, result, error}` responses where exactly one of
/// `result`/`error` is null. Outbound ids are `"<session-tag>.<counter>"` so
/// sessions sharing a transport never collide; inbound ids are echoed
/// verbatim. Anything else is rejected as a protocol violation that leaves
/// the session open.
pub struct JsonrpcSession {
    tag: u64,
    counter: u64,
    in_counter: u64,
    next_call: u64,
    invocations_in: AHashMap<u64, PendingIn>,
    invocations_out: AHashMap<String, CallId>,
    events: VecDeque<JsonrpcEvent>,
    metrics: Option<Arc<Metrics>>,
}

impl JsonrpcSession {
    /// Creates a session with a process-unique tag for outbound ids.
    pub fn new() -> Self {
        Self {
            tag: rand::random(),
            counter: 0,
            in_counter: 0,
            next_call: 1,
            invocations_in: AHashMap::new(),
            invocations_out: AHashMap::new(),
            events: VecDeque::new(),
            metrics: None,
        }
    }

    /// Attaches a metrics registry.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Outbound calls still awaiting an answer.
    pub fn pending_calls(&self) -> usize {
        self.invocations_out.len()
    }

    /// Inbound invocations still awaiting a response.
    pub fn pending_invocations(&self) -> usize {
        self.invocations_in.len()
    }

    /// Takes the next queued event.
    pub fn poll_event(&mut self) -> Option<JsonrpcEvent> {
        self.events.pop_front()
    }

    fn write<T: Transport>(
        &mut self,
        transport: &mut T,
        peer: PeerId,
        message: &Value,
    ) -> Result<(), NetError> {
        let text = message.to_string();
        transport.send(peer, Bytes::from(text))
    }

    /// Issues a method call to `peer`. Completion arrives as a
    /// [`JsonrpcEvent::Completed`] with this call's id.
    pub fn call_method<T: Transport>(
        &mut self,
        transport: &mut T,
        peer: PeerId,
        method: &str,
        params: Value,
    ) -> Result<CallId, NetError> {
        let params = normalize_params(params)?;
        self.counter += 1;
        let wire_id = format!("{:x}.{}", self.tag, self.counter);
        let message = json!({
            "id": wire_id,
            "method": method,
            "params": params,
        });

        let call = CallId(self.next_call);
        self.next_call += 1;
        self.write(transport, peer, &message)?;
        self.invocations_out.insert(wire_id, call);
        if let Some(metrics) = &self.metrics {
            metrics.jsonrpc_calls.inc();
        }
        Ok(call)
    }

    /// Sends a notification: a request with a null id and no completion.
    pub fn notify<T: Transport>(
        &mut self,
        transport: &mut T,
        peer: PeerId,
        method: &str,
        params: Value,
    ) -> Result<(), NetError> {
        let params = normalize_params(params)?;
        let message = json!({
            "id": Value::Null,
            "method": method,
            "params": params,
        });
        self.write(transport, peer, &message)
    }

    /// Answers an inbound invocation with a result.
    pub fn respond<T: Transport>(
        &mut self,
        transport: &mut T,
        invocation: InvocationId,
        result: Value,
    ) -> Result<(), NetError> {
        self.respond_internal(transport, invocation, Some(result), None)
    }

    /// Answers an inbound invocation with an error value.
    pub fn respond_error<T: Transport>(
        &mut self,
        transport: &mut T,
        invocation: InvocationId,
        error: Value,
    ) -> Result<(), NetError> {
        self.respond_internal(transport, invocation, None, Some(error))
    }

    fn respond_internal<T: Transport>(
        &mut self,
        transport: &mut T,
        invocation: InvocationId,
        result: Option<Value>,
        error: Option<Value>,
    ) -> Result<(), NetError> {
        let pending = self
            .invocations_in
            .remove(&invocation.0)
            .ok_or_else(|| NetError::ProtocolViolation("unknown invocation id".into()))?;
        let message = json!({
            "id": pending.wire_id,
            "result": result.unwrap_or(Value::Null),
            "error": error.unwrap_or(Value::Null),
        });
        self.write(transport, pending.from, &message)
    }

    /// Cancels an outbound call: its completion fires exactly once, as
    /// `Cancelled`, and a late answer from the wire is dropped.
    pub fn cancel(&mut self, call: CallId) {
        let key = self
            .invocations_out
            .iter()
            .find(|(_, &c)| c == call)
            .map(|(k, _)| k.clone());
        if let Some(key) = key {
            self.invocations_out.remove(&key);
            self.events.push_back(JsonrpcEvent::Completed {
                call,
                outcome: CallOutcome::Cancelled,
            });
        }
    }

    fn violation(&mut self, reason: &str) -> NetError {
        if let Some(metrics) = &self.metrics {
            metrics.jsonrpc_violations.inc();
        }
        debug!(reason, "json-rpc protocol violation");
        NetError::ProtocolViolation(reason.into())
    }

    /// Feeds one received frame into the session. The frame must hold one
    /// complete JSON object; violations abort the message but leave the
    /// session and its pending calls intact.
    pub fn read(&mut self, from: PeerId, frame: &[u8]) -> Result<(), NetError> {
        let root: Value = serde_json::from_slice(frame)
            .map_err(|_| self.violation("frame is not valid json"))?;
        let Value::Object(ref obj) = root else {
            return Err(self.violation("message must be a json object"));
        };
        if !obj.contains_key("id") {
            return Err(self.violation("message lacks an 'id' member"));
        }

        if obj.contains_key("result") && obj.contains_key("error") {
            self.on_response(obj)
        } else if obj.contains_key("method") && obj.contains_key("params") {
            self.on_request(from, obj)
        } else {
            Err(self.violation("message is neither a request nor a response"))
        }
    }

    fn on_request(
        &mut self,
        from: PeerId,
        obj: &serde_json::Map<String, Value>,
    ) -> Result<(), NetError> {
        let method = match obj.get("method") {
            Some(Value::String(name)) if !name.is_empty() => name.clone(),
            _ => return Err(self.violation("method name must be a non-empty string")),
        };
        let params = match obj.get("params") {
            Some(params @ Value::Array(_)) => params.clone(),
            _ => return Err(self.violation("params must be an array")),
        };
        let wire_id = obj.get("id").cloned().unwrap_or(Value::Null);

        if wire_id.is_null() {
            self.events.push_back(JsonrpcEvent::Notification {
                method,
                params,
                from,
            });
            return Ok(());
        }

        self.in_counter += 1;
        let invocation = InvocationId(self.in_counter);
        self.invocations_in
            .insert(invocation.0, PendingIn { wire_id, from });
        self.events.push_back(JsonrpcEvent::MethodCall {
            method,
            params,
            invocation,
            from,
        });
        Ok(())
    }

    fn on_response(
        &mut self,
        obj: &serde_json::Map<String, Value>,
    ) -> Result<(), NetError> {
        let id = match obj.get("id") {
            Some(Value::String(id)) => id.clone(),
            _ => return Err(self.violation("response id must be a string")),
        };
        let Some(call) = self.invocations_out.remove(&id) else {
            // A cancelled call's late answer, or noise: drop silently when
            // it cannot be correlated to anything we asked.
            return Err(self.violation("unexpected response id"));
        };

        let result = obj.get("result").cloned().unwrap_or(Value::Null);
        let error = obj.get("error").cloned().unwrap_or(Value::Null);
        let outcome = match (result.is_null(), error.is_null()) {
            (false, true) => CallOutcome::Result(result),
            (true, false) => CallOutcome::Error(error),
            _ => {
                // The id was consumed by this malformed response; complete
                // the call so the caller is not left hanging.
                self.events.push_back(JsonrpcEvent::Completed {
                    call,
                    outcome: CallOutcome::Error(json!("malformed response")),
                });
                return Err(self.violation(
                    "exactly one of result/error must be null in a response",
                ));
            }
        };

        self.events.push_back(JsonrpcEvent::Completed { call, outcome });
        Ok(())
    }
}

impl Default for JsonrpcSession {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_params(params: Value) -> Result<Value, NetError> {
    match params {
        Value::Null => Ok(Value::Array(Vec::new())),
        params @ Value::Array(_) => Ok(params),
        _ => Err(NetError::ProtocolViolation(
            "request params must be an array".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerSettings;
    use crate::peer::SharedPeerManager;
    use std::collections::VecDeque as EventQueue;

    struct WireTransport {
        manager: SharedPeerManager,
        tag: u64,
        events: EventQueue<crate::transport::TransportEvent>,
        sent: Vec<(PeerId, Bytes)>,
    }

    impl WireTransport {
        fn new() -> Self {
            Self {
                manager: SharedPeerManager::new(&PeerSettings::default()),
                tag: rand::random(),
                events: EventQueue::new(),
                sent: Vec::new(),
            }
        }

        fn take_sent(&mut self) -> Vec<(PeerId, Bytes)> {
            std::mem::take(&mut self.sent)
        }
    }

    impl Transport for WireTransport {
        fn send_frame(&mut self, peer: PeerId, frame: Bytes) -> Result<(), NetError> {
            self.sent.push((peer, frame));
            Ok(())
        }

        fn peer_is_connected(&self, _peer: PeerId) -> bool {
            true
        }

        fn peer_manager(&self) -> &SharedPeerManager {
            &self.manager
        }

        fn transport_tag(&self) -> u64 {
            self.tag
        }

        fn events(&mut self) -> &mut EventQueue<crate::transport::TransportEvent> {
            &mut self.events
        }
    }

    fn shuttle(
        from: &mut WireTransport,
        to_session: &mut JsonrpcSession,
        as_peer: PeerId,
    ) {
        for (_peer, frame) in from.take_sent() {
            to_session.read(as_peer, &frame).expect("read frame");
        }
    }

    #[test]
    fn call_and_respond_roundtrip() {
        let mut wire_a = WireTransport::new();
        let mut wire_b = WireTransport::new();
        let mut session_a = JsonrpcSession::new();
        let mut session_b = JsonrpcSession::new();
        let peer_b = wire_a.create_new_peer();
        let peer_a = wire_b.create_new_peer();

        let call = session_a
            .call_method(&mut wire_a, peer_b, "add", json!([2, 3]))
            .expect("call");
        assert_eq!(session_a.pending_calls(), 1);

        shuttle(&mut wire_a, &mut session_b, peer_a);
        let event = session_b.poll_event().expect("event");
        let JsonrpcEvent::MethodCall {
            method,
            params,
            invocation,
            ..
        } = event
        else {
            panic!("expected method call");
        };
        assert_eq!(method, "add");
        assert_eq!(params, json!([2, 3]));

        session_b
            .respond(&mut wire_b, invocation, json!(5))
            .expect("respond");
        assert_eq!(session_b.pending_invocations(), 0);

        shuttle(&mut wire_b, &mut session_a, peer_b);
        let event = session_a.poll_event().expect("completion");
        let JsonrpcEvent::Completed { call: done, outcome } = event else {
            panic!("expected completion");
        };
        assert_eq!(done, call);
        assert_eq!(outcome, CallOutcome::Result(json!(5)));
        assert_eq!(session_a.pending_calls(), 0);
    }

    #[test]
    fn error_response_completes_with_error() {
        let mut wire_a = WireTransport::new();
        let mut wire_b = WireTransport::new();
        let mut session_a = JsonrpcSession::new();
        let mut session_b = JsonrpcSession::new();
        let peer_b = wire_a.create_new_peer();
        let peer_a = wire_b.create_new_peer();

        let call = session_a
            .call_method(&mut wire_a, peer_b, "explode", Value::Null)
            .expect("call");
        shuttle(&mut wire_a, &mut session_b, peer_a);
        let Some(JsonrpcEvent::MethodCall { invocation, .. }) = session_b.poll_event()
        else {
            panic!("expected call");
        };
        session_b
            .respond_error(&mut wire_b, invocation, json!("boom"))
            .expect("respond error");

        shuttle(&mut wire_b, &mut session_a, peer_b);
        let Some(JsonrpcEvent::Completed { call: done, outcome }) = session_a.poll_event()
        else {
            panic!("expected completion");
        };
        assert_eq!(done, call);
        assert_eq!(outcome, CallOutcome::Error(json!("boom")));
    }

    #[test]
    fn notification_dispatches_without_invocation() {
        let mut wire = WireTransport::new();
        let mut sender = JsonrpcSession::new();
        let mut receiver = JsonrpcSession::new();
        let peer = wire.create_new_peer();

        sender
            .notify(&mut wire, peer, "heartbeat", json!([1]))
            .expect("notify");
        shuttle(&mut wire, &mut receiver, peer);

        let Some(JsonrpcEvent::Notification { method, .. }) = receiver.poll_event() else {
            panic!("expected notification");
        };
        assert_eq!(method, "heartbeat");
        assert_eq!(receiver.pending_invocations(), 0);
    }

    #[test]
    fn cancel_completes_exactly_once_and_drops_late_answer() {
        let mut wire_a = WireTransport::new();
        let mut session_a = JsonrpcSession::new();
        let peer_b = wire_a.create_new_peer();

        let call = session_a
            .call_method(&mut wire_a, peer_b, "slow", Value::Null)
            .expect("call");
        let sent = wire_a.take_sent();
        let request: Value = serde_json::from_slice(&sent[0].1).expect("request json");
        let wire_id = request["id"].clone();

        session_a.cancel(call);
        let Some(JsonrpcEvent::Completed { outcome, .. }) = session_a.poll_event() else {
            panic!("expected cancelled completion");
        };
        assert_eq!(outcome, CallOutcome::Cancelled);

        // The late answer no longer correlates, so it is rejected without a
        // second completion.
        let late = json!({"id": wire_id, "result": 1, "error": null}).to_string();
        assert!(session_a.read(peer_b, late.as_bytes()).is_err());
        assert!(session_a.poll_event().is_none());

        // Cancelling again is a no-op.
        session_a.cancel(call);
        assert!(session_a.poll_event().is_none());
    }

    #[test]
    fn malformed_messages_are_violations_but_session_survives() {
        let mut wire = WireTransport::new();
        let mut session = JsonrpcSession::new();
        let peer = wire.create_new_peer();

        for bad in [
            "not json at all",
            "[1,2,3]",
            r#"{"method":"x","params":[]}"#,
            r#"{"id":1,"method":"x","params":{}}"#,
            r#"{"id":1,"method":7,"params":[]}"#,
            r#"{"id":"z","something":"else"}"#,
        ] {
            assert!(matches!(
                session.read(peer, bad.as_bytes()),
                Err(NetError::ProtocolViolation(_))
            ));
        }

        // Still able to process a well-formed request afterwards.
        let good = r#"{"id":9,"method":"ping","params":[]}"#;
        session.read(peer, good.as_bytes()).expect("good request");
        assert!(matches!(
            session.poll_event(),
            Some(JsonrpcEvent::MethodCall { .. })
        ));
    }

    #[test]
    fn response_with_both_result_and_error_set_is_rejected() {
        let mut wire = WireTransport::new();
        let mut session = JsonrpcSession::new();
        let peer = wire.create_new_peer();

        let call = session
            .call_method(&mut wire, peer, "ambiguous", Value::Null)
            .expect("call");
        let sent = wire.take_sent();
        let request: Value = serde_json::from_slice(&sent[0].1).expect("json");
        let id = request["id"].clone();

        let bad = json!({"id": id, "result": 1, "error": "no"}).to_string();
        assert!(session.read(peer, bad.as_bytes()).is_err());
        // The call still completed (with an error outcome), exactly once.
        let Some(JsonrpcEvent::Completed { call: done, outcome }) = session.poll_event()
        else {
            panic!("expected completion");
        };
        assert_eq!(done, call);
        assert!(matches!(outcome, CallOutcome::Error(_)));
    }

    #[test]
    fn outbound_ids_carry_session_tag_and_counter() {
        let mut wire = WireTransport::new();
        let mut session = JsonrpcSession::new();
        let peer = wire.create_new_peer();

        session
            .call_method(&mut wire, peer, "a", Value::Null)
            .expect("call");
        session
            .call_method(&mut wire, peer, "b", Value::Null)
            .expect("call");
        let sent = wire.take_sent();
        let first: Value = serde_json::from_slice(&sent[0].1).expect("json");
        let second: Value = serde_json::from_slice(&sent[1].1).expect("json");
        let first_id = first["id"].as_str().expect("string id");
        let second_id = second["id"].as_str().expect("string id");

        let (tag_a, n_a) = first_id.split_once('.').expect("tag.counter");
        let (tag_b, n_b) = second_id.split_once('.').expect("tag.counter");
        assert_eq!(tag_a, tag_b);
        assert_eq!(n_a, "1");
        assert_eq!(n_b, "2");
    }
}
