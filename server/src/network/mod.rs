//! TCP plumbing between clients and the world
//!
//! - `session`: the outbound half of a connection, shared with the player
//! - `connection`: the inbound half, stream framing and login progress
//! - `login`: the handshake and credential exchange
//! - `dispatcher`: the non-blocking accept, read, write and reap cycle run
//!   once per tick

pub mod connection;
pub mod dispatcher;
pub mod login;
pub mod session;

pub use connection::{
    Connection, ConnectionError, IncomingPacket, Occupant, ReadOutcome, Stage, INBOUND_CAPACITY,
};
pub use dispatcher::{Dispatcher, ACCEPT_BATCH};
pub use login::{LoginProgress, LoginRequest, LoginResponse};
pub use session::{Session, SessionError, SessionHandle, OUTBOUND_CAPACITY};
