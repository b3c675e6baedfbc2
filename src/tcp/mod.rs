//! TCP request/response subsystem.
//!
//! A [`Listener`] accepts sockets, consults an optional
//! [`ConnectionFilter`], and registers each admitted [`Connection`] with
//! its [`ConnectionPool`]. Connections read length-prefixed frames, pass
//! them to a [`RequestHandler`] and record both directions in the
//! listener's [`AuditTrail`].

pub mod audit;
pub mod connection;
pub mod framing;
pub mod listener;
pub mod pool;

pub use audit::{AuditEntry, AuditTrail, ConnectionId, Direction};
pub use connection::{
    Connection, ConnectionOptions, ConnectionState, MAX_READ_SIZE, RequestHandler, Response,
    Transport,
};
pub use framing::{FrameDecoder, MAX_FRAME_LEN, encode_frame};
pub use listener::{ConnectionFilter, Listener, ListenerOptions};
pub use pool::ConnectionPool;
