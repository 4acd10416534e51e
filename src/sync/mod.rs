//! Incremental synchronization between a workflow and live client sessions.

mod hub;
mod protocol;
mod session;
mod transport;

pub use hub::{SyncHub, WorkflowFactory};
pub use protocol::{ClientMessage, ServerMessage, StateChange};
pub use session::Session;
pub use transport::{ChannelClient, ChannelTransport, Transport};
