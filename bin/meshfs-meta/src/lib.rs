//! meshfs Metadata Server
//!
//! Back channel plumbing of the metadata server: the storage node directory,
//! the wire transport, the message classes served by the send queue and the
//! heartbeat that keeps node liveness current.

pub mod back_channel;
pub mod heartbeat;
pub mod node;
pub mod transport;
