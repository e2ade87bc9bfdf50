use super::connection::{Connection, ConnectionError, Occupant, ReadOutcome, Stage};
use super::login::{self, LoginProgress};
use crate::engine::Services;
use crate::handlers::{HandlerContext, HandlerRegistry};
use crate::world::World;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener};

/// Sockets accepted per cycle at most.
pub const ACCEPT_BATCH: usize = 10;

/// Owns the listening socket and every open connection, and moves bytes
/// between them and the world once per tick.
///
/// Each cycle runs four phases in order: accept, read and dispatch, write,
/// reap. Closing a connection happens only in the reap phase, so a
/// connection that failed both reading and writing is still torn down once.
pub struct Dispatcher {
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: HashMap<u64, Connection>,
    handlers: HandlerRegistry,
    next_id: u64,
}

impl Dispatcher {
    pub fn bind(addr: SocketAddr, handlers: HandlerRegistry) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!("Listening on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
            connections: HashMap::new(),
            handlers,
            next_id: 1,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn handlers_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.handlers
    }

    /// Runs one network cycle against the world.
    pub fn service(&mut self, world: &mut World, services: &Services) {
        self.accept(services);
        self.read(world, services);
        self.write();
        self.reap(world, services);
    }

    fn accept(&mut self, services: &Services) {
        for _ in 0..ACCEPT_BATCH {
            let (stream, addr) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    break;
                }
            };

            if let Err(rejection) = services.gateway.admit(addr.ip()) {
                info!("Rejected connection from {}: {}", addr, rejection);
                continue;
            }

            let id = self.next_id;
            self.next_id += 1;
            match Connection::new(id, stream, addr) {
                Ok(connection) => {
                    info!("Accepted connection {} from {}", id, addr);
                    self.connections.insert(id, connection);
                }
                Err(e) => {
                    warn!("Could not configure socket from {}: {}", addr, e);
                    services.gateway.exit(addr.ip());
                }
            }
        }
    }

    fn read(&mut self, world: &mut World, services: &Services) {
        let Self {
            connections,
            handlers,
            ..
        } = self;

        for connection in connections.values_mut() {
            if connection.session().is_disconnect_requested() {
                continue;
            }
            let outcome = connection
                .read()
                .and_then(|outcome| decode(connection, world, services, handlers).map(|_| outcome));
            match outcome {
                Ok(ReadOutcome::Closed) => {
                    debug!("Connection {} closed by peer", connection.id());
                    connection.session().request_disconnect();
                }
                Ok(_) => {}
                Err(ConnectionError::Rejected(_)) => {}
                Err(e) => {
                    warn!("Dropping connection {} ({}): {}", connection.id(), connection.addr(), e);
                    connection.session().request_disconnect();
                }
            }
        }
    }

    fn write(&mut self) {
        for connection in self.connections.values_mut() {
            if let Err(e) = connection.write() {
                debug!("Write to connection {} failed: {}", connection.id(), e);
                connection.session().request_disconnect();
            }
        }
    }

    fn reap(&mut self, world: &mut World, services: &Services) {
        let timeout = services.config.idle_timeout;
        let closing: Vec<u64> = self
            .connections
            .iter()
            .filter(|(_, connection)| {
                connection.session().is_disconnect_requested() || connection.is_idle(timeout)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in closing {
            let Some(connection) = self.connections.remove(&id) else {
                continue;
            };
            if let Some(Occupant { slot, key }) = connection.occupant {
                world.unregister_player_if(slot, key);
            }
            services.gateway.exit(connection.addr().ip());
            connection.shutdown();
            info!("Disconnected connection {} ({})", id, connection.addr());
        }
    }

    /// Drops every connection, unregistering their players.
    pub fn close_all(&mut self, world: &mut World, services: &Services) {
        for connection in self.connections.values() {
            connection.session().request_disconnect();
        }
        self.write();
        self.reap(world, services);
    }
}

/// Feeds buffered bytes to the login exchange or the packet handlers until
/// nothing complete remains.
fn decode(
    connection: &mut Connection,
    world: &mut World,
    services: &Services,
    handlers: &HandlerRegistry,
) -> Result<(), ConnectionError> {
    loop {
        if connection.stage() != Stage::LoggedIn {
            match login::advance(connection, world, &services.config)? {
                LoginProgress::Pending => return Ok(()),
                LoginProgress::Complete(_) => continue,
            }
        }

        let Some(occupant) = connection.occupant else {
            return Err(ConnectionError::NotLoggedIn);
        };
        if world
            .player(occupant.slot)
            .map_or(true, |player| player.key != occupant.key)
        {
            connection.session().request_disconnect();
            return Ok(());
        }
        if connection.session().is_disconnect_requested() {
            return Ok(());
        }

        let Some(packet) = connection.next_packet()? else {
            return Ok(());
        };
        let mut ctx = HandlerContext::new(world, services, occupant.slot, packet.opcode);
        if let Err(e) = handlers.dispatch(&mut ctx, &packet) {
            error!(
                "Handler for opcode {} failed for connection {}: {}",
                packet.opcode,
                connection.id(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::gateway::{GatewayConfig, HostGateway};
    use crate::handlers::HandlerError;
    use crate::scheduler::Scheduler;
    use crate::world::Player;
    use parking_lot::Mutex;
    use shared::packet::client;
    use shared::{ByteOrder, IsaacCipher, Keystream, PacketReader, ValueType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::Arc;
    use std::time::Duration;

    struct Harness {
        _runtime: tokio::runtime::Runtime,
        world: Arc<Mutex<World>>,
        services: Services,
        dispatcher: Dispatcher,
    }

    impl Harness {
        fn new(config: ServerConfig) -> Self {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            let world = Arc::new(Mutex::new(World::new()));
            let gateway = Arc::new(HostGateway::new(config.gateway));
            let scheduler = Scheduler::new(runtime.handle().clone(), config.tick);
            let services = Services::new(scheduler, &world, gateway, Arc::new(config));
            let dispatcher =
                Dispatcher::bind("127.0.0.1:0".parse().unwrap(), HandlerRegistry::with_defaults())
                    .unwrap();
            Self {
                _runtime: runtime,
                world,
                services,
                dispatcher,
            }
        }

        fn cycle(&mut self) {
            let mut world = self.world.lock();
            self.dispatcher.service(&mut world, &self.services);
        }

        fn connect(&self) -> TcpStream {
            let stream = TcpStream::connect(self.dispatcher.local_addr()).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_millis(500)))
                .unwrap();
            stream
        }

        /// Cycles until `done` holds or a second passes.
        fn cycle_until(&mut self, mut done: impl FnMut(&Self) -> bool) -> bool {
            for _ in 0..100 {
                self.cycle();
                if done(self) {
                    return true;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            false
        }
    }

    fn config() -> ServerConfig {
        ServerConfig {
            gateway: GatewayConfig {
                connection_limit: 2,
                rate_window: Duration::ZERO,
            },
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_accept_and_handshake() {
        let mut harness = Harness::new(config());
        let mut client = harness.connect();
        assert!(harness.cycle_until(|h| h.dispatcher.connection_count() == 1));

        client.write_all(&[14, 0]).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        let mut reply = Vec::new();
        for _ in 0..100 {
            harness.cycle();
            let mut chunk = [0u8; 32];
            if let Ok(n) = client.read(&mut chunk) {
                reply.extend_from_slice(&chunk[..n]);
            }
            if reply.len() >= 17 {
                break;
            }
        }
        assert_eq!(reply.len(), 17);
        assert!(reply[..9].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_gateway_cap_closes_extra_connection() {
        let mut harness = Harness::new(config());
        let _first = harness.connect();
        let _second = harness.connect();
        let mut third = harness.connect();

        assert!(harness.cycle_until(|h| h.dispatcher.connection_count() == 2));
        for _ in 0..5 {
            harness.cycle();
        }
        assert_eq!(harness.dispatcher.connection_count(), 2);

        let mut buf = [0u8; 1];
        assert!(matches!(third.read(&mut buf), Ok(0) | Err(_)));
    }

    #[test]
    fn test_peer_close_releases_gateway() {
        let mut harness = Harness::new(config());
        let client = harness.connect();
        assert!(harness.cycle_until(|h| h.dispatcher.connection_count() == 1));
        let ip = client.local_addr().unwrap().ip();
        assert_eq!(harness.services.gateway.connection_count(ip), 1);

        drop(client);
        assert!(harness.cycle_until(|h| h.dispatcher.connection_count() == 0));
        assert_eq!(harness.services.gateway.connection_count(ip), 0);
    }

    #[test]
    fn test_bad_handshake_disconnects() {
        let mut harness = Harness::new(config());
        let mut client = harness.connect();
        assert!(harness.cycle_until(|h| h.dispatcher.connection_count() == 1));
        client.write_all(&[99, 0]).unwrap();
        assert!(harness.cycle_until(|h| h.dispatcher.connection_count() == 0));
    }

    #[test]
    fn test_idle_connection_times_out() {
        let mut harness = Harness::new(ServerConfig {
            idle_timeout: Duration::from_millis(50),
            ..config()
        });
        let _client = harness.connect();
        assert!(harness.cycle_until(|h| h.dispatcher.connection_count() == 1));
        std::thread::sleep(Duration::from_millis(80));
        harness.cycle();
        assert_eq!(harness.dispatcher.connection_count(), 0);
    }

    #[test]
    fn test_failed_handlers_do_not_desync_stream() {
        let mut harness = Harness::new(config());
        let mut client = harness.connect();
        assert!(harness.cycle_until(|h| h.dispatcher.connection_count() == 1));

        let clicks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&clicks);
        let handlers = harness.dispatcher.handlers_mut();
        handlers.register(
            client::CHAT,
            |_: &mut HandlerContext<'_>, reader: &mut PacketReader<'_>| -> Result<(), HandlerError> {
                reader.get_u8(ValueType::Standard)?;
                Err(HandlerError::Invalid("rejected chat".to_string()))
            },
        );
        handlers.register(
            client::IDLE,
            |_: &mut HandlerContext<'_>, _: &mut PacketReader<'_>| -> Result<(), HandlerError> {
                panic!("idle handler blew up")
            },
        );
        handlers.register(
            client::BUTTON_CLICK,
            move |_: &mut HandlerContext<'_>, reader: &mut PacketReader<'_>| -> Result<(), HandlerError> {
                assert_eq!(reader.get_u16(ValueType::Standard, ByteOrder::Big)?, 0x0099);
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );

        let key = 77;
        {
            let mut world = harness.world.lock();
            let connection = harness.dispatcher.connections.values_mut().next().unwrap();
            let spawn = harness.services.config.spawn;
            let player = Player::new(key, "steady", spawn, connection.session().clone());
            let slot = world.register_player(player).unwrap();
            connection.establish(IsaacCipher::new(&[9; 4]), Occupant { slot, key });
        }

        let mut encoder = IsaacCipher::new(&[9; 4]);
        let mut bytes = vec![encoder.encode_opcode(client::CHAT), 3, 1, 2, 3];
        bytes.push(encoder.encode_opcode(client::IDLE));
        bytes.extend_from_slice(&[encoder.encode_opcode(client::BUTTON_CLICK), 0x00, 0x99]);
        client.write_all(&bytes).unwrap();

        assert!(harness.cycle_until(|_| clicks.load(Ordering::SeqCst) == 1));
        for _ in 0..3 {
            harness.cycle();
        }
        assert_eq!(clicks.load(Ordering::SeqCst), 1);
        assert_eq!(harness.dispatcher.connection_count(), 1);
        let connection = harness.dispatcher.connections.values().next().unwrap();
        assert!(!connection.session().is_disconnect_requested());
        assert!(connection.inbound.is_empty());
        assert_eq!(harness.world.lock().players.len(), 1);
    }
}
