// D-Bus bridge: line-framed JSON commands dispatched into a bus agent.
// Numan Thabit 2026

use std::{collections::VecDeque, sync::Arc};

use serde_json::{json, Value};
use tracing::debug;

use crate::{metrics::Metrics, peer::PeerId};

/// Bridge commands carried as `[cmd, serial, subject, args]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BridgeCmd {
    Error = 1,
    Reply = 2,
    NewConnection = 3,
    CloseConnection = 4,
    OwnName = 5,
    UnownName = 6,
    NameAcquired = 7,
    NameLost = 8,
    RegisterObject = 9,
    UnregisterObject = 10,
    NewProxy = 11,
    CloseProxy = 12,
    CallMethod = 13,
    CallMethodReturn = 14,
    EmitSignal = 15,
}

/// Error codes answered on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeErr {
    Failed = 0,
    InvalidMsg = 1,
    UnknownCommand = 2,
    InvalidSubject = 3,
    InvalidArgs = 4,
    ConnectionFailed = 5,
    AlreadyRegistered = 6,
    ProxyFailed = 7,
    UnknownMethod = 8,
}

/// Failures an agent reports back to the bridge.
#[derive(Debug)]
pub enum AgentError {
    InvalidSubject,
    InvalidArgs,
    ConnectionFailed(String),
    AlreadyRegistered,
    ProxyFailed(String),
    UnknownMethod,
    Failed(String),
}

impl AgentError {
    fn code(&self) -> BridgeErr {
        match self {
            AgentError::InvalidSubject => BridgeErr::InvalidSubject,
            AgentError::InvalidArgs => BridgeErr::InvalidArgs,
            AgentError::ConnectionFailed(_) => BridgeErr::ConnectionFailed,
            AgentError::AlreadyRegistered => BridgeErr::AlreadyRegistered,
            AgentError::ProxyFailed(_) => BridgeErr::ProxyFailed,
            AgentError::UnknownMethod => BridgeErr::UnknownMethod,
            AgentError::Failed(_) => BridgeErr::Failed,
        }
    }

    fn message(&self) -> Option<&str> {
        match self {
            AgentError::ConnectionFailed(msg)
            | AgentError::ProxyFailed(msg)
            | AgentError::Failed(msg) => Some(msg),
            _ => None,
        }
    }
}

/// The underlying bus agent the bridge dispatches into. Implementations
/// must not block: every method runs on the owning thread.
pub trait DbusAgent {
    fn new_connection(&mut self, address: &str) -> Result<u32, AgentError>;
    fn close_connection(&mut self, connection: u32) -> Result<(), AgentError>;
    fn own_name(&mut self, connection: u32, name: &str, flags: u32) -> Result<u32, AgentError>;
    fn unown_name(&mut self, owning_id: u32) -> Result<(), AgentError>;
    fn register_object(
        &mut self,
        connection: u32,
        object_path: &str,
        interface_xml: &str,
    ) -> Result<u32, AgentError>;
    fn unregister_object(&mut self, registration: u32) -> Result<(), AgentError>;
    #[allow(clippy::too_many_arguments)]
    fn new_proxy(
        &mut self,
        connection: u32,
        name: &str,
        object_path: &str,
        interface: &str,
        flags: u32,
    ) -> Result<u32, AgentError>;
    fn close_proxy(&mut self, proxy: u32) -> Result<(), AgentError>;
    #[allow(clippy::too_many_arguments)]
    fn call_method(
        &mut self,
        proxy: u32,
        method: &str,
        json_args: &str,
        signature: &str,
        flags: u32,
        timeout_ms: i32,
    ) -> Result<(String, String), AgentError>;
    fn method_call_return(
        &mut self,
        registration: u32,
        serial: u64,
        json_result: &str,
        signature: &str,
    ) -> Result<(), AgentError>;
    fn emit_signal(
        &mut self,
        registration: u32,
        name: &str,
        json_args: &str,
        signature: &str,
    ) -> Result<(), AgentError>;
}

/// Thin dispatcher between bridge frames and a [`DbusAgent`].
///
/// Inbound frames are JSON arrays `[cmd:u8, serial:u64, subject:u32,
/// args:string]`; `args` holds the JSON-encoded tuple for the command.
/// Every reply and error echoes the request's serial. Malformed input is
/// answered with a typed error, never a panic.
pub struct DbusBridge<A: DbusAgent> {
    agent: A,
    outgoing: VecDeque<(PeerId, String)>,
    metrics: Option<Arc<Metrics>>,
}

impl<A: DbusAgent> DbusBridge<A> {
    /// Wraps an agent.
    pub fn new(agent: A) -> Self {
        Self {
            agent,
            outgoing: VecDeque::new(),
            metrics: None,
        }
    }

    /// Attaches a metrics registry.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Access to the wrapped agent.
    pub fn agent_mut(&mut self) -> &mut A {
        &mut self.agent
    }

    /// Takes the next frame queued for sending.
    pub fn poll_outgoing(&mut self) -> Option<(PeerId, String)> {
        self.outgoing.pop_front()
    }

    fn push(&mut self, peer: PeerId, cmd: BridgeCmd, serial: u64, subject: u32, args: Value) {
        let frame = json!([cmd as u8, serial, subject, args.to_string()]);
        self.outgoing.push_back((peer, frame.to_string()));
    }

    fn push_error(
        &mut self,
        peer: PeerId,
        serial: u64,
        subject: u32,
        code: BridgeErr,
        message: Option<&str>,
    ) {
        if let Some(metrics) = &self.metrics {
            metrics.bridge_cmd_errors.inc();
        }
        let args = match message {
            Some(msg) => json!([code as u8, msg]),
            None => json!([code as u8]),
        };
        self.push(peer, BridgeCmd::Error, serial, subject, args);
    }

    fn push_agent_error(&mut self, peer: PeerId, serial: u64, subject: u32, err: &AgentError) {
        self.push_error(peer, serial, subject, err.code(), err.message());
    }

    /// Processes one inbound frame from `peer`.
    pub fn process_message(&mut self, peer: PeerId, text: &str) {
        let Some((cmd, serial, subject, args)) = parse_envelope(text) else {
            debug!(%peer, "malformed bridge envelope");
            self.push_error(peer, 0, 0, BridgeErr::InvalidMsg, None);
            return;
        };

        match cmd {
            3 => self.on_new_connection(peer, serial, &args),
            4 => self.on_close_connection(peer, serial, subject),
            5 => self.on_own_name(peer, serial, subject, &args),
            6 => self.on_unown_name(peer, serial, subject, &args),
            9 => self.on_register_object(peer, serial, subject, &args),
            10 => self.on_unregister_object(peer, serial, subject),
            11 => self.on_new_proxy(peer, serial, subject, &args),
            12 => self.on_close_proxy(peer, serial, subject),
            13 => self.on_call_method(peer, serial, subject, &args),
            14 => self.on_call_method_return(peer, serial, subject, &args),
            15 => self.on_emit_signal(peer, serial, subject, &args),
            _ => self.push_error(peer, serial, 0, BridgeErr::UnknownCommand, None),
        }
    }

    fn on_new_connection(&mut self, peer: PeerId, serial: u64, args: &str) {
        let Some([Value::String(address)]) = parse_tuple::<1>(args) else {
            self.push_error(peer, serial, 0, BridgeErr::InvalidArgs, None);
            return;
        };
        match self.agent.new_connection(&address) {
            Ok(connection) => {
                self.push(peer, BridgeCmd::Reply, serial, 0, json!([connection]));
            }
            Err(err) => self.push_agent_error(peer, serial, 0, &err),
        }
    }

    fn on_close_connection(&mut self, peer: PeerId, serial: u64, subject: u32) {
        match self.agent.close_connection(subject) {
            Ok(()) => self.push(peer, BridgeCmd::Reply, serial, subject, json!([])),
            Err(err) => self.push_agent_error(peer, serial, subject, &err),
        }
    }

    fn on_own_name(&mut self, peer: PeerId, serial: u64, subject: u32, args: &str) {
        let Some([Value::String(name), Value::Number(flags)]) = parse_tuple::<2>(args) else {
            self.push_error(peer, serial, 0, BridgeErr::InvalidArgs, None);
            return;
        };
        let Some(flags) = flags.as_u64().and_then(|f| u32::try_from(f).ok()) else {
            self.push_error(peer, serial, 0, BridgeErr::InvalidArgs, None);
            return;
        };
        match self.agent.own_name(subject, &name, flags) {
            Ok(owning_id) => {
                self.push(peer, BridgeCmd::Reply, serial, subject, json!([owning_id]));
            }
            Err(err) => self.push_agent_error(peer, serial, 0, &err),
        }
    }

    fn on_unown_name(&mut self, peer: PeerId, serial: u64, subject: u32, args: &str) {
        let Some([Value::Number(owning_id)]) = parse_tuple::<1>(args) else {
            self.push_error(peer, serial, 0, BridgeErr::InvalidArgs, None);
            return;
        };
        let Some(owning_id) = owning_id.as_u64().and_then(|v| u32::try_from(v).ok()) else {
            self.push_error(peer, serial, 0, BridgeErr::InvalidArgs, None);
            return;
        };
        match self.agent.unown_name(owning_id) {
            Ok(()) => self.push(peer, BridgeCmd::Reply, serial, subject, json!([])),
            Err(err) => self.push_agent_error(peer, serial, subject, &err),
        }
    }

    fn on_register_object(&mut self, peer: PeerId, serial: u64, subject: u32, args: &str) {
        let Some([Value::String(path), Value::String(iface_xml)]) = parse_tuple::<2>(args)
        else {
            self.push_error(peer, serial, 0, BridgeErr::InvalidArgs, None);
            return;
        };
        match self.agent.register_object(subject, &path, &iface_xml) {
            Ok(registration) => {
                self.push(
                    peer,
                    BridgeCmd::Reply,
                    serial,
                    subject,
                    json!([registration]),
                );
            }
            Err(err) => self.push_agent_error(peer, serial, subject, &err),
        }
    }

    fn on_unregister_object(&mut self, peer: PeerId, serial: u64, subject: u32) {
        match self.agent.unregister_object(subject) {
            Ok(()) => self.push(peer, BridgeCmd::Reply, serial, subject, json!([])),
            Err(err) => self.push_agent_error(peer, serial, subject, &err),
        }
    }

    fn on_new_proxy(&mut self, peer: PeerId, serial: u64, subject: u32, args: &str) {
        let Some(
            [Value::String(name), Value::String(path), Value::String(iface), Value::Number(flags)],
        ) = parse_tuple::<4>(args)
        else {
            self.push_error(peer, serial, 0, BridgeErr::InvalidArgs, None);
            return;
        };
        let Some(flags) = flags.as_u64().and_then(|f| u32::try_from(f).ok()) else {
            self.push_error(peer, serial, 0, BridgeErr::InvalidArgs, None);
            return;
        };
        match self.agent.new_proxy(subject, &name, &path, &iface, flags) {
            Ok(proxy) => self.push(peer, BridgeCmd::Reply, serial, subject, json!([proxy])),
            Err(err) => self.push_agent_error(peer, serial, subject, &err),
        }
    }

    fn on_close_proxy(&mut self, peer: PeerId, serial: u64, subject: u32) {
        match self.agent.close_proxy(subject) {
            Ok(()) => self.push(peer, BridgeCmd::Reply, serial, subject, json!([])),
            Err(err) => self.push_agent_error(peer, serial, subject, &err),
        }
    }

    fn on_call_method(&mut self, peer: PeerId, serial: u64, subject: u32, args: &str) {
        let Some(
            [Value::String(method), Value::String(json_args), Value::String(signature), Value::Number(flags), Value::Number(timeout)],
        ) = parse_tuple::<5>(args)
        else {
            self.push_error(peer, serial, 0, BridgeErr::InvalidArgs, None);
            return;
        };
        let (Some(flags), Some(timeout)) = (
            flags.as_u64().and_then(|f| u32::try_from(f).ok()),
            timeout.as_i64().and_then(|t| i32::try_from(t).ok()),
        ) else {
            self.push_error(peer, serial, 0, BridgeErr::InvalidArgs, None);
            return;
        };
        match self
            .agent
            .call_method(subject, &method, &json_args, &signature, flags, timeout)
        {
            Ok((result_json, result_signature)) => {
                self.push(
                    peer,
                    BridgeCmd::CallMethodReturn,
                    serial,
                    subject,
                    json!([result_json, result_signature]),
                );
            }
            Err(err) => self.push_agent_error(peer, serial, subject, &err),
        }
    }

    fn on_call_method_return(&mut self, peer: PeerId, serial: u64, subject: u32, args: &str) {
        let Some([Value::String(json_result), Value::String(signature)]) =
            parse_tuple::<2>(args)
        else {
            self.push_error(peer, serial, 0, BridgeErr::InvalidArgs, None);
            return;
        };
        if let Err(err) =
            self.agent
                .method_call_return(subject, serial, &json_result, &signature)
        {
            self.push_agent_error(peer, serial, 0, &err);
        }
    }

    fn on_emit_signal(&mut self, peer: PeerId, serial: u64, subject: u32, args: &str) {
        let Some([Value::String(name), Value::String(json_args), Value::String(signature)]) =
            parse_tuple::<3>(args)
        else {
            self.push_error(peer, serial, 0, BridgeErr::InvalidArgs, None);
            return;
        };
        if let Err(err) = self
            .agent
            .emit_signal(subject, &name, &json_args, &signature)
        {
            self.push_agent_error(peer, serial, subject, &err);
        }
    }

    // ---- agent-originated notifications ---------------------------------

    /// Announces that a requested name was acquired.
    pub fn notify_name_acquired(&mut self, peer: PeerId, subject: u32, owning_id: u32) {
        self.push(
            peer,
            BridgeCmd::NameAcquired,
            0,
            subject,
            json!([owning_id]),
        );
    }

    /// Announces that an owned name was lost.
    pub fn notify_name_lost(&mut self, peer: PeerId, subject: u32, owning_id: u32) {
        self.push(peer, BridgeCmd::NameLost, 0, subject, json!([owning_id]));
    }

    /// Forwards a proxy signal to the peer.
    pub fn notify_proxy_signal(
        &mut self,
        peer: PeerId,
        proxy: u32,
        name: &str,
        json_args: &str,
        signature: &str,
    ) {
        self.push(
            peer,
            BridgeCmd::EmitSignal,
            0,
            proxy,
            json!([name, json_args, signature]),
        );
    }

    /// Forwards a method call on a registered object to the peer.
    pub fn notify_method_called(
        &mut self,
        peer: PeerId,
        registration: u32,
        serial: u64,
        method: &str,
        json_args: &str,
        signature: &str,
    ) {
        self.push(
            peer,
            BridgeCmd::CallMethod,
            serial,
            registration,
            json!([method, json_args, signature, 0, 0]),
        );
    }

    /// Property-change notifications have no wire message; the hook exists
    /// so agents can call it unconditionally.
    pub fn notify_proxy_properties_changed(&mut self, _peer: PeerId, _proxy: u32) {}
}

fn parse_envelope(text: &str) -> Option<(u8, u64, u32, String)> {
    let root: Value = serde_json::from_str(text).ok()?;
    let items = root.as_array()?;
    if items.len() != 4 {
        return None;
    }
    let cmd = u8::try_from(items[0].as_u64()?).ok()?;
    let serial = items[1].as_u64()?;
    let subject = u32::try_from(items[2].as_u64()?).ok()?;
    let args = items[3].as_str()?.to_string();
    Some((cmd, serial, subject, args))
}

/// Parses an args string as a JSON tuple with exactly `N` members.
fn parse_tuple<const N: usize>(args: &str) -> Option<[Value; N]> {
    let root: Value = serde_json::from_str(args).ok()?;
    let Value::Array(items) = root else {
        return None;
    };
    items.try_into().ok()
}
