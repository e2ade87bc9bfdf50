use super::login::LoginResponse;
use super::session::{Session, SessionError, SessionHandle};
use bytes::{Buf, Bytes, BytesMut};
use shared::{inbound_length, CodecError, IsaacCipher, Keystream, PacketLength, PacketReader};
use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Bytes read from a socket per call.
const READ_CHUNK: usize = 4096;
/// Unparsed inbound bytes a connection may accumulate.
pub const INBOUND_CAPACITY: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("inbound buffer exceeded {0} bytes")]
    Flooded(usize),

    #[error("game packet before login completed")]
    NotLoggedIn,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("login rejected: {0:?}")]
    Rejected(LoginResponse),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Waiting for the handshake byte pair.
    Unauthenticated,
    /// Server key sent, waiting for the login block.
    LoggingIn,
    LoggedIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    WouldBlock,
    Closed,
}

/// A framed game packet whose payload has been split off the stream.
#[derive(Debug, Clone)]
pub struct IncomingPacket {
    pub opcode: u8,
    pub payload: Bytes,
}

impl IncomingPacket {
    pub fn reader(&self) -> PacketReader<'_> {
        PacketReader::new(&self.payload)
    }
}

/// A player the connection logged in, identified by slot and login key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupant {
    pub slot: usize,
    pub key: u64,
}

/// The receiving half of a socket plus its login progress.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    session: SessionHandle,
    pub(crate) inbound: BytesMut,
    stage: Stage,
    pending_opcode: Option<u8>,
    pending_length: Option<usize>,
    decoder: Option<IsaacCipher>,
    last_activity: Instant,
    pub(crate) server_key: u64,
    pub(crate) occupant: Option<Occupant>,
}

impl Connection {
    pub fn new(id: u64, stream: TcpStream, addr: SocketAddr) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            session: Session::new(id, addr),
            inbound: BytesMut::with_capacity(READ_CHUNK),
            stage: Stage::Unauthenticated,
            pending_opcode: None,
            pending_length: None,
            decoder: None,
            last_activity: Instant::now(),
            server_key: 0,
            occupant: None,
        })
    }

    pub fn id(&self) -> u64 {
        self.session.id()
    }

    pub fn addr(&self) -> SocketAddr {
        self.session.addr()
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub(crate) fn set_stage(&mut self, stage: Stage) {
        self.stage = stage;
    }

    /// Completes login: installs the inbound cipher and records the player.
    pub(crate) fn establish(&mut self, decoder: IsaacCipher, occupant: Occupant) {
        self.decoder = Some(decoder);
        self.occupant = Some(occupant);
        self.stage = Stage::LoggedIn;
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }

    /// Performs one non-blocking read into the inbound buffer.
    pub fn read(&mut self) -> Result<ReadOutcome, ConnectionError> {
        let mut chunk = [0u8; READ_CHUNK];
        match self.stream.read(&mut chunk) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(n) => {
                if self.inbound.len() + n > INBOUND_CAPACITY {
                    return Err(ConnectionError::Flooded(INBOUND_CAPACITY));
                }
                self.inbound.extend_from_slice(&chunk[..n]);
                self.last_activity = Instant::now();
                Ok(ReadOutcome::Data(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(ReadOutcome::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    /// Flushes queued outbound bytes with a single write.
    pub fn write(&mut self) -> io::Result<usize> {
        self.session.flush(&mut self.stream)
    }

    /// Frames the next complete game packet, or `None` when more bytes are
    /// needed. A partially received header is remembered between calls.
    pub fn next_packet(&mut self) -> Result<Option<IncomingPacket>, ConnectionError> {
        let decoder = self.decoder.as_mut().ok_or(ConnectionError::NotLoggedIn)?;

        let opcode = match self.pending_opcode {
            Some(opcode) => opcode,
            None => {
                if self.inbound.is_empty() {
                    return Ok(None);
                }
                let opcode = decoder.decode_opcode(self.inbound.get_u8());
                self.pending_opcode = Some(opcode);
                opcode
            }
        };

        let length = match self.pending_length {
            Some(length) => length,
            None => {
                let length = match inbound_length(opcode) {
                    PacketLength::Fixed(length) => length,
                    PacketLength::VarByte => {
                        if self.inbound.is_empty() {
                            return Ok(None);
                        }
                        self.inbound.get_u8() as usize
                    }
                    PacketLength::VarShort => {
                        if self.inbound.len() < 2 {
                            return Ok(None);
                        }
                        self.inbound.get_u16() as usize
                    }
                };
                self.pending_length = Some(length);
                length
            }
        };

        if self.inbound.len() < length {
            return Ok(None);
        }
        let payload = self.inbound.split_to(length).freeze();
        self.pending_opcode = None;
        self.pending_length = None;
        Ok(Some(IncomingPacket { opcode, payload }))
    }

    /// Closes both directions of the socket. Errors are irrelevant here.
    pub(crate) fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}
