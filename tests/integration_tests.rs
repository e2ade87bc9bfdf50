//! Integration tests for the networked server
//!
//! These tests drive a bound server over real loopback sockets, speaking the
//! client side of the protocol by hand.

use server::config::ServerConfig;
use server::gateway::GatewayConfig;
use server::network::{LoginRequest, LoginResponse};
use server::persistence::SnapshotSaver;
use server::scheduler::Scheduler;
use server::Server;
use shared::packet::{client, server as opcodes};
use shared::{
    inbound_length, outbound_length, seeds_from_keys, Keystream, PacketLength, SessionCiphers,
};
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const CLIENT_KEY: u64 = 0x0123_4567_89ab_cdef;

fn scratch_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("tickscape-it-{}-{}", name, nanos))
}

/// A server driven one cycle at a time from the test thread.
struct TestServer {
    server: Option<Server>,
    save_dir: PathBuf,
    _runtime: tokio::runtime::Runtime,
}

impl TestServer {
    fn new(name: &str, connection_limit: u32) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let save_dir = scratch_dir(name);
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            gateway: GatewayConfig {
                connection_limit,
                rate_window: Duration::ZERO,
            },
            save_dir: save_dir.clone(),
            ..ServerConfig::default()
        };
        let scheduler = Scheduler::new(runtime.handle().clone(), Duration::from_millis(600));
        let server = Server::bind(config, scheduler).unwrap();
        Self {
            server: Some(server),
            save_dir,
            _runtime: runtime,
        }
    }

    fn server(&mut self) -> &mut Server {
        self.server.as_mut().unwrap()
    }

    fn cycle(&mut self) {
        self.server().cycle();
    }

    fn connect(&mut self) -> TestClient {
        TestClient::connect(self.server().local_addr())
    }

    fn online(&mut self) -> usize {
        self.server().world().lock().players.len()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.save_dir);
    }
}

/// The client half of the protocol.
struct TestClient {
    stream: TcpStream,
    inbound: Vec<u8>,
    ciphers: Option<SessionCiphers>,
    pending_opcode: Option<u8>,
    closed: bool,
}

impl TestClient {
    fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_nonblocking(true).unwrap();
        Self {
            stream,
            inbound: Vec::new(),
            ciphers: None,
            pending_opcode: None,
            closed: false,
        }
    }

    /// Moves whatever the socket holds into the inbound buffer.
    fn poll(&mut self) {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.closed = true;
                    break;
                }
                Ok(n) => self.inbound.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.closed = true;
                    break;
                }
            }
        }
    }

    /// Cycles the server until `len` raw bytes are buffered, then takes them.
    fn take_raw(&mut self, server: &mut TestServer, len: usize) -> Vec<u8> {
        for _ in 0..200 {
            server.cycle();
            self.poll();
            if self.inbound.len() >= len {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(self.inbound.len() >= len, "timed out waiting for {} bytes", len);
        self.inbound.drain(..len).collect()
    }

    fn handshake(&mut self, server: &mut TestServer) -> u64 {
        self.stream.write_all(&[14, 0]).unwrap();
        let reply = self.take_raw(server, 17);
        assert!(reply[..9].iter().all(|&b| b == 0));
        u64::from_be_bytes(reply[9..17].try_into().unwrap())
    }

    fn login(&mut self, server: &mut TestServer, username: &str) -> LoginResponse {
        let server_key = self.handshake(server);
        let request = LoginRequest {
            reconnecting: false,
            revision: shared::PROTOCOL_REVISION,
            low_memory: false,
            client_key: CLIENT_KEY,
            server_key,
            uid: 0,
            username: username.to_string(),
            password: "hunter2".to_string(),
        };
        self.stream.write_all(&request.encode()).unwrap();

        let code = self.take_raw(server, 1)[0];
        let response = LoginResponse::from_code(code).unwrap();
        if response == LoginResponse::Success {
            let _rights_and_flag = self.take_raw(server, 2);
            self.ciphers = Some(SessionCiphers::client(seeds_from_keys(CLIENT_KEY, server_key)));
        }
        response
    }

    fn send(&mut self, opcode: u8, payload: &[u8]) {
        let ciphers = self.ciphers.as_mut().unwrap();
        let mut frame = vec![ciphers.encoder.encode_opcode(opcode)];
        match inbound_length(opcode) {
            PacketLength::Fixed(len) => assert_eq!(len, payload.len()),
            PacketLength::VarByte => frame.push(payload.len() as u8),
            PacketLength::VarShort => frame.extend_from_slice(&(payload.len() as u16).to_be_bytes()),
        }
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).unwrap();
    }

    /// Frames the next complete server packet out of the inbound buffer.
    fn next_packet(&mut self) -> Option<(u8, Vec<u8>)> {
        let ciphers = self.ciphers.as_mut()?;
        let opcode = match self.pending_opcode {
            Some(opcode) => opcode,
            None => {
                let first = *self.inbound.first()?;
                self.inbound.remove(0);
                let opcode = ciphers.decoder.decode_opcode(first);
                self.pending_opcode = Some(opcode);
                opcode
            }
        };
        let (header, len) = match outbound_length(opcode) {
            Some(PacketLength::Fixed(len)) => (0, len),
            Some(PacketLength::VarByte) => (1, *self.inbound.first()? as usize),
            Some(PacketLength::VarShort) => {
                if self.inbound.len() < 2 {
                    return None;
                }
                (2, u16::from_be_bytes([self.inbound[0], self.inbound[1]]) as usize)
            }
            None => panic!("unexpected server opcode {}", opcode),
        };
        if self.inbound.len() < header + len {
            return None;
        }
        let payload = self.inbound[header..header + len].to_vec();
        self.inbound.drain(..header + len);
        self.pending_opcode = None;
        Some((opcode, payload))
    }

    /// Cycles the server until a packet with `opcode` arrives.
    fn await_packet(&mut self, server: &mut TestServer, opcode: u8) -> Vec<u8> {
        for _ in 0..200 {
            while let Some((received, payload)) = self.next_packet() {
                if received == opcode {
                    return payload;
                }
            }
            server.cycle();
            self.poll();
            thread::sleep(Duration::from_millis(2));
        }
        panic!("timed out waiting for opcode {}", opcode);
    }

    fn await_close(&mut self, server: &mut TestServer) -> bool {
        for _ in 0..200 {
            server.cycle();
            self.poll();
            while self.next_packet().is_some() {}
            if self.closed {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }
}

/// Tail of a PLAYER_UPDATE carrying only the observer's animation block:
/// mask 0x08, animation id little-endian, delay negated.
fn animation_tail(id: u16) -> [u8; 4] {
    let [low, high] = id.to_le_bytes();
    [0x08, low, high, 0]
}

/// LOGIN TESTS
mod login_tests {
    use super::*;

    /// Tests the full handshake and login over a real socket
    #[test]
    fn login_registers_player() {
        let mut server = TestServer::new("login", 2);
        let mut client = server.connect();

        assert_eq!(client.login(&mut server, "Dancer"), LoginResponse::Success);
        let init = client.await_packet(&mut server, opcodes::INITIALIZE_PLAYER);
        assert_eq!(init.len(), 3);
        client.await_packet(&mut server, opcodes::LOAD_REGION);

        assert_eq!(server.online(), 1);
        let world = server.server().world();
        let world = world.lock();
        let slot = world.find_player("dancer").unwrap();
        assert_eq!(world.player(slot).unwrap().username, "Dancer");
    }

    /// Tests that a second login under the same name is refused
    #[test]
    fn duplicate_login_rejected() {
        let mut server = TestServer::new("duplicate", 2);
        let mut first = server.connect();
        assert_eq!(first.login(&mut server, "twin"), LoginResponse::Success);

        let mut second = server.connect();
        assert_eq!(second.login(&mut server, "Twin"), LoginResponse::AlreadyOnline);
        assert!(second.await_close(&mut server));
        assert_eq!(server.online(), 1);
    }

    /// Tests that the gateway refuses connections past the per-host limit
    #[test]
    fn gateway_limits_connections_per_host() {
        let mut server = TestServer::new("gateway", 1);
        let mut first = server.connect();
        assert_eq!(first.login(&mut server, "first"), LoginResponse::Success);

        let mut extra = server.connect();
        assert!(extra.await_close(&mut server));

        let host = first.stream.local_addr().unwrap().ip();
        assert_eq!(server.server().gateway().connection_count(host), 1);
    }
}

/// GAMEPLAY TESTS
mod gameplay_tests {
    use super::*;

    /// Tests that an emote click reaches the update packet for exactly one tick
    #[test]
    fn emote_appears_in_one_update() {
        let mut server = TestServer::new("emote", 2);
        let mut client = server.connect();
        assert_eq!(client.login(&mut server, "Dancer"), LoginResponse::Success);

        // Let placement and the forced appearance go out first.
        for _ in 0..3 {
            client.await_packet(&mut server, opcodes::PLAYER_UPDATE);
        }

        client.send(client::BUTTON_CLICK, &166u16.to_be_bytes());
        let expected = animation_tail(866);
        let mut found = false;
        for _ in 0..20 {
            let update = client.await_packet(&mut server, opcodes::PLAYER_UPDATE);
            if update.ends_with(&expected) {
                found = true;
                break;
            }
        }
        assert!(found, "dance animation never reached the client");

        let next = client.await_packet(&mut server, opcodes::PLAYER_UPDATE);
        assert_eq!(next, vec![0, 0]);
    }

    /// Tests that the logout button closes the connection and frees the slot
    #[test]
    fn logout_button_disconnects() {
        let mut server = TestServer::new("logout", 2);
        let mut client = server.connect();
        assert_eq!(client.login(&mut server, "leaver"), LoginResponse::Success);
        client.await_packet(&mut server, opcodes::PLAYER_UPDATE);

        client.send(client::BUTTON_CLICK, &2458u16.to_be_bytes());
        client.await_packet(&mut server, opcodes::LOGOUT);
        assert!(client.await_close(&mut server));
        assert_eq!(server.online(), 0);

        let host = client.stream.local_addr().unwrap().ip();
        assert_eq!(server.server().gateway().connection_count(host), 0);
    }

    /// Tests that a dropped socket unregisters its player
    #[test]
    fn dropped_socket_unregisters_player() {
        let mut server = TestServer::new("drop", 2);
        let mut client = server.connect();
        assert_eq!(client.login(&mut server, "ghost"), LoginResponse::Success);
        assert_eq!(server.online(), 1);

        drop(client);
        for _ in 0..200 {
            server.cycle();
            if server.online() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(server.online(), 0);
    }
}

/// LIFECYCLE TESTS
mod lifecycle_tests {
    use super::*;

    /// Tests that a started engine keeps ticking on the task pool
    #[test]
    fn started_server_ticks() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            tick: Duration::from_millis(10),
            ..ServerConfig::default()
        };
        let scheduler = Scheduler::new(runtime.handle().clone(), config.tick);
        let mut server = Server::bind(config, scheduler).unwrap();
        server.start().unwrap();
        assert!(server.start().is_err());

        thread::sleep(Duration::from_millis(150));
        assert!(server.world().lock().tick() > 3);
        assert!(server.stats().ticks > 3);

        let saver = SnapshotSaver::new(scratch_dir("started"));
        server.shutdown(&saver).unwrap();
    }

    /// Tests that shutdown saves online players and a later login restores them
    #[test]
    fn shutdown_saves_snapshots() {
        let mut server = TestServer::new("snapshots", 2);
        let mut client = server.connect();
        assert_eq!(client.login(&mut server, "Saver"), LoginResponse::Success);
        {
            let world = server.server().world();
            let mut world = world.lock();
            let slot = world.find_player("saver").unwrap();
            world.player_mut(slot).unwrap().run_energy = 42;
        }

        let saver = SnapshotSaver::new(server.save_dir.clone());
        server.server.take().unwrap().shutdown(&saver).unwrap();

        let snapshot = saver.load("Saver").unwrap().unwrap();
        assert_eq!(snapshot.username, "Saver");
        assert_eq!(snapshot.run_energy, 42);
    }
}
