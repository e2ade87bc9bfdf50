//! The two-step login exchange that precedes game traffic.
//!
//! - Handshake: the client announces itself with `[14, name_hash]` and
//!   receives eight zero bytes, a `0` response and a random server key
//! - Login block: `[16 | 18, block_len]` followed by the block itself, which
//!   carries the revision, both session keys and the credentials
//!
//! Validation failures answer a single response code and close the
//! connection. Success answers `[2, rights, 0]`, installs both keystreams
//! and registers the player.

use super::connection::{Connection, ConnectionError, Occupant, Stage};
use crate::config::ServerConfig;
use crate::packets;
use crate::persistence::SnapshotSaver;
use crate::world::{Player, Rights, World};
use bytes::Buf;
use log::{info, warn};
use shared::{
    format_name, seeds_from_keys, ByteOrder, PacketBuffer, PacketReader, SessionCiphers, ValueType,
    MAX_NAME_LENGTH,
};

pub const HANDSHAKE_OPCODE: u8 = 14;
pub const NEW_LOGIN: u8 = 16;
pub const RECONNECT_LOGIN: u8 = 18;
pub const BLOCK_MAGIC: u8 = 255;
pub const KEY_MARKER: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginResponse {
    Exchange = 0,
    Success = 2,
    InvalidCredentials = 3,
    AlreadyOnline = 5,
    RevisionMismatch = 6,
    WorldFull = 7,
    BadSessionKey = 10,
}

impl LoginResponse {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(LoginResponse::Exchange),
            2 => Some(LoginResponse::Success),
            3 => Some(LoginResponse::InvalidCredentials),
            5 => Some(LoginResponse::AlreadyOnline),
            6 => Some(LoginResponse::RevisionMismatch),
            7 => Some(LoginResponse::WorldFull),
            10 => Some(LoginResponse::BadSessionKey),
            _ => None,
        }
    }
}

/// The decoded login block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub reconnecting: bool,
    pub revision: u16,
    pub low_memory: bool,
    pub client_key: u64,
    pub server_key: u64,
    pub uid: u32,
    pub username: String,
    pub password: String,
}

impl LoginRequest {
    pub fn decode(reconnecting: bool, block: &[u8]) -> Result<Self, ConnectionError> {
        let mut reader = PacketReader::new(block);
        let magic = reader.get_u8(ValueType::Standard)?;
        if magic != BLOCK_MAGIC {
            return Err(ConnectionError::Protocol(format!("bad login magic {}", magic)));
        }
        let revision = reader.get_u16(ValueType::Standard, ByteOrder::Big)?;
        let low_memory = reader.get_u8(ValueType::Standard)? == 1;
        let marker = reader.get_u8(ValueType::Standard)?;
        if marker != KEY_MARKER {
            return Err(ConnectionError::Protocol(format!("bad key marker {}", marker)));
        }
        Ok(Self {
            reconnecting,
            revision,
            low_memory,
            client_key: reader.get_u64(ValueType::Standard, ByteOrder::Big)?,
            server_key: reader.get_u64(ValueType::Standard, ByteOrder::Big)?,
            uid: reader.get_u32(ValueType::Standard, ByteOrder::Big)?,
            username: reader.get_string()?,
            password: reader.get_string()?,
        })
    }

    /// Frames the request the way a client sends it, header included.
    pub fn encode(&self) -> Vec<u8> {
        let mut block = PacketBuffer::new();
        block
            .put_u8(BLOCK_MAGIC, ValueType::Standard)
            .put_u16(self.revision, ValueType::Standard, ByteOrder::Big)
            .put_u8(self.low_memory as u8, ValueType::Standard)
            .put_u8(KEY_MARKER, ValueType::Standard)
            .put_u64(self.client_key, ValueType::Standard, ByteOrder::Big)
            .put_u64(self.server_key, ValueType::Standard, ByteOrder::Big)
            .put_u32(self.uid, ValueType::Standard, ByteOrder::Big)
            .put_string(&self.username)
            .put_string(&self.password);

        let kind = if self.reconnecting {
            RECONNECT_LOGIN
        } else {
            NEW_LOGIN
        };
        let mut framed = vec![kind, block.len() as u8];
        framed.extend_from_slice(block.as_slice());
        framed
    }

    fn credentials_valid(&self) -> bool {
        let name = self.username.trim();
        !name.is_empty()
            && name.len() <= MAX_NAME_LENGTH
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '_')
            && !self.password.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginProgress {
    /// More bytes are needed.
    Pending,
    Complete(Occupant),
}

/// Consumes as much of the login exchange as the inbound buffer allows.
pub fn advance(
    connection: &mut Connection,
    world: &mut World,
    config: &ServerConfig,
) -> Result<LoginProgress, ConnectionError> {
    loop {
        match connection.stage() {
            Stage::Unauthenticated => {
                if connection.inbound.len() < 2 {
                    return Ok(LoginProgress::Pending);
                }
                let opcode = connection.inbound.get_u8();
                let _name_hash = connection.inbound.get_u8();
                if opcode != HANDSHAKE_OPCODE {
                    return Err(ConnectionError::Protocol(format!(
                        "unexpected handshake opcode {}",
                        opcode
                    )));
                }
                connection.server_key = rand::random();
                let mut reply = [0u8; 17];
                reply[8] = LoginResponse::Exchange.code();
                reply[9..].copy_from_slice(&connection.server_key.to_be_bytes());
                connection.session().send_raw(&reply)?;
                connection.set_stage(Stage::LoggingIn);
            }
            Stage::LoggingIn => {
                if connection.inbound.len() < 2 {
                    return Ok(LoginProgress::Pending);
                }
                let kind = connection.inbound[0];
                if kind != NEW_LOGIN && kind != RECONNECT_LOGIN {
                    return Err(ConnectionError::Protocol(format!("unexpected login type {}", kind)));
                }
                let block_len = connection.inbound[1] as usize;
                if connection.inbound.len() < 2 + block_len {
                    return Ok(LoginProgress::Pending);
                }
                connection.inbound.advance(2);
                let block = connection.inbound.split_to(block_len);
                let request = LoginRequest::decode(kind == RECONNECT_LOGIN, &block)?;
                return complete(connection, world, config, request).map(LoginProgress::Complete);
            }
            Stage::LoggedIn => {
                return Err(ConnectionError::Protocol("already logged in".to_string()));
            }
        }
    }
}

fn validate(
    connection: &Connection,
    world: &World,
    config: &ServerConfig,
    request: &LoginRequest,
) -> Result<(), LoginResponse> {
    if request.revision != config.revision {
        return Err(LoginResponse::RevisionMismatch);
    }
    if request.server_key != connection.server_key {
        return Err(LoginResponse::BadSessionKey);
    }
    if !request.credentials_valid() {
        return Err(LoginResponse::InvalidCredentials);
    }
    if world.find_player(&request.username).is_some() {
        return Err(LoginResponse::AlreadyOnline);
    }
    if world.players.is_full() {
        return Err(LoginResponse::WorldFull);
    }
    Ok(())
}

fn complete(
    connection: &mut Connection,
    world: &mut World,
    config: &ServerConfig,
    request: LoginRequest,
) -> Result<Occupant, ConnectionError> {
    if let Err(response) = validate(connection, world, config, &request) {
        info!(
            "Login for '{}' from {} refused: {:?}",
            request.username,
            connection.addr(),
            response
        );
        connection.session().send_raw(&[response.code()])?;
        connection.session().request_disconnect();
        return Err(ConnectionError::Rejected(response));
    }

    let username = format_name(request.username.trim());
    let key = connection.id();
    let mut player = Player::new(key, username.clone(), config.spawn, connection.session().clone());
    if config.is_administrator(&username) {
        player.rights = Rights::Administrator;
    }
    match SnapshotSaver::new(&config.save_dir).load(&username) {
        Ok(Some(snapshot)) => snapshot.restore(&mut player),
        Ok(None) => {}
        Err(e) => warn!("Could not restore '{}': {}", username, e),
    }
    let rights = player.rights;

    let slot = match world.register_player(player) {
        Ok(slot) => slot,
        Err(_) => {
            connection
                .session()
                .send_raw(&[LoginResponse::WorldFull.code()])?;
            connection.session().request_disconnect();
            return Err(ConnectionError::Rejected(LoginResponse::WorldFull));
        }
    };

    let ciphers = SessionCiphers::server(seeds_from_keys(request.client_key, request.server_key));
    let session = connection.session().clone();
    session.send_raw(&[LoginResponse::Success.code(), rights as u8, 0])?;
    session.set_cipher(ciphers.encoder);
    session.send(&packets::initialize_player(slot, true))?;
    session.send(&packets::game_message("Welcome to Tickscape."))?;

    let occupant = Occupant { slot, key };
    connection.establish(ciphers.decoder, occupant);
    info!(
        "'{}' logged in from {} (slot {}, {:?})",
        username,
        connection.addr(),
        slot,
        rights
    );
    Ok(occupant)
}
