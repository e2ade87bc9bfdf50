use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use shared::{CodecError, IsaacCipher, OutgoingPacket, PacketBuffer};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Bytes a session may have queued before it is considered stalled.
pub const OUTBOUND_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("outbound buffer full: {queued} queued, {needed} more needed")]
    Overflow { queued: usize, needed: usize },

    #[error("session is closing")]
    Closed,

    #[error("session has no cipher yet")]
    NotEstablished,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

struct Outbound {
    buffer: BytesMut,
    cipher: Option<IsaacCipher>,
}

/// The sending half of a connection, shared between the socket owner and
/// whatever game object writes to it.
///
/// Packet headers are encoded at queue time under the lock, so keystream
/// order always matches byte order on the wire.
pub struct Session {
    id: u64,
    addr: SocketAddr,
    outbound: Mutex<Outbound>,
    disconnect: AtomicBool,
}

pub type SessionHandle = Arc<Session>;

impl Session {
    pub fn new(id: u64, addr: SocketAddr) -> SessionHandle {
        Arc::new(Self {
            id,
            addr,
            outbound: Mutex::new(Outbound {
                buffer: BytesMut::with_capacity(4096),
                cipher: None,
            }),
            disconnect: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queues a game packet, encoding its header with the session cipher.
    pub fn send(&self, packet: &OutgoingPacket) -> Result<(), SessionError> {
        if self.is_disconnect_requested() {
            return Err(SessionError::Closed);
        }
        let mut guard = self.outbound.lock();
        let Outbound { buffer, cipher } = &mut *guard;
        let cipher = cipher.as_mut().ok_or(SessionError::NotEstablished)?;
        reserve(buffer, packet.wire_len())?;

        let mut encoded = PacketBuffer::with_capacity(packet.wire_len());
        packet.encode_into(&mut encoded, cipher)?;
        buffer.extend_from_slice(encoded.as_slice());
        Ok(())
    }

    /// Queues bytes verbatim. Used during the login exchange.
    pub fn send_raw(&self, bytes: &[u8]) -> Result<(), SessionError> {
        let mut guard = self.outbound.lock();
        reserve(&mut guard.buffer, bytes.len())?;
        guard.buffer.extend_from_slice(bytes);
        Ok(())
    }

    pub(crate) fn set_cipher(&self, cipher: IsaacCipher) {
        self.outbound.lock().cipher = Some(cipher);
    }

    pub fn is_established(&self) -> bool {
        self.outbound.lock().cipher.is_some()
    }

    /// Marks the session for closing. The dispatcher flushes what is queued
    /// and closes it at the end of the current cycle.
    pub fn request_disconnect(&self) {
        self.disconnect.store(true, Ordering::Release);
    }

    pub fn is_disconnect_requested(&self) -> bool {
        self.disconnect.load(Ordering::Acquire)
    }

    pub fn pending_bytes(&self) -> usize {
        self.outbound.lock().buffer.len()
    }

    /// Takes everything queued without writing it anywhere.
    pub fn drain(&self) -> Bytes {
        self.outbound.lock().buffer.split().freeze()
    }

    /// Writes as much as the sink accepts in one call and keeps the rest.
    pub(crate) fn flush<W: Write>(&self, sink: &mut W) -> io::Result<usize> {
        let mut guard = self.outbound.lock();
        if guard.buffer.is_empty() {
            return Ok(0);
        }
        match sink.write(&guard.buffer) {
            Ok(written) => {
                guard.buffer.advance(written);
                Ok(written)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}

fn reserve(buffer: &mut BytesMut, needed: usize) -> Result<(), SessionError> {
    if buffer.len() + needed > OUTBOUND_CAPACITY {
        return Err(SessionError::Overflow {
            queued: buffer.len(),
            needed,
        });
    }
    Ok(())
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("pending", &self.pending_bytes())
            .field("disconnect", &self.is_disconnect_requested())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::packet::server;
    use shared::{Keystream, ValueType};

    fn session() -> SessionHandle {
        Session::new(1, "127.0.0.1:5000".parse().unwrap())
    }

    fn energy(value: u8) -> OutgoingPacket {
        let mut payload = PacketBuffer::new();
        payload.put_u8(value, ValueType::Standard);
        OutgoingPacket::server(server::RUN_ENERGY, payload)
    }

    #[test]
    fn test_send_requires_cipher() {
        let session = session();
        assert!(matches!(session.send(&energy(1)), Err(SessionError::NotEstablished)));
        session.set_cipher(IsaacCipher::new(&[1, 2, 3, 4]));
        session.send(&energy(1)).unwrap();
        assert_eq!(session.pending_bytes(), 2);
    }

    #[test]
    fn test_headers_follow_queue_order() {
        let session = session();
        session.set_cipher(IsaacCipher::new(&[9, 9, 9, 9]));
        session.send(&energy(10)).unwrap();
        session.send(&energy(20)).unwrap();

        let bytes = session.drain();
        let mut reference = IsaacCipher::new(&[9, 9, 9, 9]);
        assert_eq!(reference.decode_opcode(bytes[0]), server::RUN_ENERGY);
        assert_eq!(bytes[1], 10);
        assert_eq!(reference.decode_opcode(bytes[2]), server::RUN_ENERGY);
        assert_eq!(bytes[3], 20);
        assert_eq!(session.pending_bytes(), 0);
    }

    #[test]
    fn test_overflow_rejected() {
        let session = session();
        session.send_raw(&vec![0u8; OUTBOUND_CAPACITY - 1]).unwrap();
        assert!(matches!(
            session.send_raw(&[1, 2]),
            Err(SessionError::Overflow { .. })
        ));
        assert_eq!(session.pending_bytes(), OUTBOUND_CAPACITY - 1);
    }

    #[test]
    fn test_partial_flush_keeps_remainder() {
        struct Trickle(Vec<u8>);
        impl Write for Trickle {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                let n = buf.len().min(3);
                self.0.extend_from_slice(&buf[..n]);
                Ok(n)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let session = session();
        session.send_raw(&[1, 2, 3, 4, 5]).unwrap();
        let mut sink = Trickle(Vec::new());
        assert_eq!(session.flush(&mut sink).unwrap(), 3);
        assert_eq!(session.pending_bytes(), 2);
        assert_eq!(session.flush(&mut sink).unwrap(), 2);
        assert_eq!(sink.0, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_closed_session_refuses_packets() {
        let session = session();
        session.set_cipher(IsaacCipher::new(&[0; 4]));
        session.request_disconnect();
        assert!(matches!(session.send(&energy(5)), Err(SessionError::Closed)));
    }
}
