//! Admission control for incoming connections
//!
//! Every accepted socket passes through [`HostGateway::enter`] before any
//! bytes are read from it, and through [`HostGateway::exit`] exactly once when
//! it closes. Checks are applied in this order:
//! - Reconnect rate limiting for hosts that already hold a connection
//! - Loopback-only restricted mode
//! - The ban list
//! - The per-host connection cap

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use log::{debug, info, warn};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Why a host was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    RateLimited,
    Restricted,
    Banned,
    TooManyConnections,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            Rejection::RateLimited => "reconnecting too quickly",
            Rejection::Restricted => "server is restricted to local connections",
            Rejection::Banned => "host is banned",
            Rejection::TooManyConnections => "too many connections from host",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Simultaneous connections allowed per host.
    pub connection_limit: u32,
    /// Minimum spacing between connections from a host that already holds one.
    pub rate_window: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            connection_limit: 1,
            rate_window: Duration::from_millis(1_000),
        }
    }
}

/// Per-host connection accounting shared between the dispatcher and
/// administrative code.
#[derive(Debug)]
pub struct HostGateway {
    config: GatewayConfig,
    connections: DashMap<IpAddr, u32>,
    last_connect: DashMap<IpAddr, Instant>,
    banned: DashSet<IpAddr>,
    restricted: AtomicBool,
}

impl HostGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            connections: DashMap::new(),
            last_connect: DashMap::new(),
            banned: DashSet::new(),
            restricted: AtomicBool::new(false),
        }
    }

    /// Records a connection attempt, returning whether it may proceed.
    pub fn enter(&self, host: IpAddr) -> bool {
        match self.admit(host) {
            Ok(()) => true,
            Err(rejection) => {
                debug!("Rejected connection from {}: {}", host, rejection);
                false
            }
        }
    }

    /// Like [`enter`](Self::enter) but reports the reason for a refusal.
    ///
    /// The reconnect instant is kept only for hosts that end up holding a
    /// connection, so refused hosts leave nothing behind.
    pub fn admit(&self, host: IpAddr) -> Result<(), Rejection> {
        let active = self.connection_count(host);
        if active > 0 {
            if let Some(last) = self.last_connect.get(&host) {
                if last.elapsed() < self.config.rate_window {
                    return Err(Rejection::RateLimited);
                }
            }
        }

        let result = self.claim(host);
        if result.is_ok() || active > 0 {
            self.last_connect.insert(host, Instant::now());
        }
        result
    }

    fn claim(&self, host: IpAddr) -> Result<(), Rejection> {
        if self.is_restricted() && !host.is_loopback() {
            return Err(Rejection::Restricted);
        }
        if self.banned.contains(&host) {
            return Err(Rejection::Banned);
        }
        if self.config.connection_limit == 0 {
            return Err(Rejection::TooManyConnections);
        }

        match self.connections.entry(host) {
            Entry::Occupied(mut entry) => {
                if *entry.get() >= self.config.connection_limit {
                    return Err(Rejection::TooManyConnections);
                }
                *entry.get_mut() += 1;
            }
            Entry::Vacant(entry) => {
                entry.insert(1);
            }
        }
        Ok(())
    }

    /// Releases one connection held by `host`. Unknown hosts are ignored.
    pub fn exit(&self, host: IpAddr) {
        if let Entry::Occupied(mut entry) = self.connections.entry(host) {
            if *entry.get() <= 1 {
                entry.remove();
                self.last_connect.remove(&host);
            } else {
                *entry.get_mut() -= 1;
            }
        }
    }

    pub fn connection_count(&self, host: IpAddr) -> u32 {
        self.connections.get(&host).map(|count| *count).unwrap_or(0)
    }

    pub fn is_tracked(&self, host: IpAddr) -> bool {
        self.connections.contains_key(&host) || self.last_connect.contains_key(&host)
    }

    pub fn set_restricted(&self, restricted: bool) {
        self.restricted.store(restricted, Ordering::Release);
        info!(
            "Connections {}",
            if restricted { "restricted to loopback" } else { "unrestricted" }
        );
    }

    pub fn is_restricted(&self) -> bool {
        self.restricted.load(Ordering::Acquire)
    }

    pub fn ban(&self, host: IpAddr) -> bool {
        self.banned.insert(host)
    }

    pub fn unban(&self, host: IpAddr) -> bool {
        self.banned.remove(&host).is_some()
    }

    pub fn is_banned(&self, host: IpAddr) -> bool {
        self.banned.contains(&host)
    }

    /// Loads one address per line. Blank lines and `#` comments are skipped,
    /// unparseable lines are logged and skipped.
    pub fn load_bans(&self, path: &Path) -> std::io::Result<usize> {
        let contents = std::fs::read_to_string(path)?;
        let mut loaded = 0;
        for (number, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.parse::<IpAddr>() {
                Ok(host) => {
                    if self.ban(host) {
                        loaded += 1;
                    }
                }
                Err(_) => warn!("Ignoring invalid ban entry on line {}: {}", number + 1, line),
            }
        }
        info!("Loaded {} banned hosts from {}", loaded, path.display());
        Ok(loaded)
    }
}

impl Default for HostGateway {
    fn default() -> Self {
        Self::new(GatewayConfig::default())
    }
}
