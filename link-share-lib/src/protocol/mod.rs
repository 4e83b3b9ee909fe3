//! C5/C6 — protocol engine and wire codec.
//!
//! [`engine::Engine`] owns one [`engine::ConnectionContext`] per STANDARD
//! interface and drives HELO/ANNOUNCE exchange over [`transport::Transport`].
//! [`codec`] defines the JSON frames on the wire; [`host_table`] tracks
//! remote peer liveness.

pub mod codec;
pub mod engine;
pub mod host_table;
pub mod transport;

pub use engine::{ConnectionContext, Engine};
pub use host_table::HostTable;
pub use transport::{RealTransport, Transport};
