// Numibus peer-to-peer IPC public library surface.
// Numan Thabit 2026

pub mod config;

pub mod error;

pub mod metrics;

pub mod reactor;

pub mod sched;

pub mod resolver;

pub mod throttle;

pub mod tls;

pub mod stream;

pub mod socket;

pub mod reproxy;

pub mod peer;

pub mod transport;

pub mod jsonrpc;

pub mod dbus_bridge;

pub use config::{Config, ConfigError, PeerSettings, ReproxySettings, SocketSettings};

pub use error::{CertStatus, NetError};

pub use reactor::{Interest, Reactor, Readiness, ReadyEvent};

pub use sched::{Scheduler, TaskHandle, PRIORITY_DEFAULT, PRIORITY_HIGH, PRIORITY_LOW};

pub use resolver::{CancelToken, Family, NbAddr, ResolveId, ResolveReply, Resolver};

pub use throttle::{Grant, Throttle};

pub use tls::{
    HandshakeStatus, TlsCredentials, TlsMode, TlsSession, TlsState, DEFAULT_PRIORITY,
};

pub use stream::{Pipeline, ReadOutcome, WriteOutcome};

pub use socket::{Endpoint, GroupId, SocketEvent, SocketId, SocketState};

pub use reproxy::{Backend, BridgeConnector, BridgeId, ClientId, Reproxy, ReproxyEvent};

pub use peer::{Peer, PeerCloseState, PeerId, PeerManager, SharedPeerManager};

pub use transport::{receive_text, SocketTransport, Transport, TransportEvent};

pub use jsonrpc::{CallId, CallOutcome, InvocationId, JsonrpcEvent, JsonrpcSession};

pub use dbus_bridge::{AgentError, BridgeCmd, BridgeErr, DbusAgent, DbusBridge};

pub use metrics::{Metrics, MetricsError};
