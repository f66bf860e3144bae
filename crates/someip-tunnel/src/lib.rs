//! someip-tunnel: bridges a SOME/IP-style RPC runtime and a shared-memory
//! publish/subscribe transport.
//!
//! Requests, service discovery and event notifications from the RPC side
//! are framed into fixed-size records for the peer process; frames from the
//! peer are turned back into RPC calls.

pub mod bridge;
pub mod config;
pub mod correlation;
pub mod ipc;
pub mod logging;
pub mod rpc;
pub mod supervisor;
pub mod wire;

#[cfg(test)]
mod testing;

pub use bridge::{Bridge, BridgeError, BridgeState, RunningBridge};
pub use config::{ConfigError, TunnelConfig};
pub use correlation::{CorrelationError, CorrelationTable};
pub use ipc::{IpcError, Publisher, ServiceConfig, Subscriber, Transport};
pub use rpc::local::{LocalApplication, LocalRuntime};
pub use rpc::{Application, Message, MessageType, ReturnCode, RpcError};
pub use supervisor::{
    ReadinessNotifier, Supervisor, SupervisorError, SupervisorState, Tunnel, TunnelFactory,
};
pub use wire::{Frame, FrameError, MessageKind, WireHeader, WirePayload};
