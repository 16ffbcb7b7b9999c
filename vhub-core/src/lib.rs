//! # vhub-core
//!
//! Client library for the Blackmagic VideoHub-style routing control
//! protocol: ASCII text blocks separated by blank lines over TCP.
//!
//! This crate contains:
//! - **Events**: `EventDispatcher`, typed `HubEvent` publish/subscribe
//! - **Protocol types**: `Block`, `Frame`, `FieldKey`, `BlockTitle`
//! - **Codec**: `BlockCodec` for blank-line framing via `tokio_util`
//! - **Commands**: `Command`, `CommandTicket` and the one-in-flight `CommandQueue`
//! - **Network**: `Connection` with retrying connect and a liveness probe
//! - **State**: `DeviceState` mirror and the connection phase machine
//! - **Hub**: `VideoHub`, the facade wiring all of the above together
//! - **Error**: `HubError`, typed, `thiserror`-based

pub mod block;
pub mod codec;
pub mod command;
pub mod error;
pub mod event;
pub mod hub;
pub mod message;
pub mod network;
pub mod queue;
pub mod state;
mod sync;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use block::{Block, FieldKey, Frame};
pub use codec::{BlockCodec, MAX_FRAME_SIZE};
pub use command::{Command, CommandOutcome, CommandTicket, FieldFormat};
pub use error::HubError;
pub use event::{EventDispatcher, EventKind, HubEvent, SubscriptionId};
pub use hub::VideoHub;
pub use message::{BlockTitle, DEFAULT_PORT};
pub use network::{
    ConnectOptions, Connection, ConnectionInfo, Dialer, LivenessProbe, LoopExit, PingProbe,
    ProbeLink, TcpDialer,
};
pub use queue::{CommandQueue, Transmit};
pub use state::{
    ConnectionPhase, DeviceState, DeviceUpdate, RouteRequest, StatusMeta, StatusSnapshot,
};
