//! Player snapshots written when the server shuts down and read back on
//! login.

use crate::world::{Appearance, Player, Rights, World};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use shared::Position;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("snapshot I/O failed for {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Encoding(#[from] bincode::Error),
}

/// What survives a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub username: String,
    pub position: Position,
    pub rights: Rights,
    pub appearance: Appearance,
    pub run_energy: u8,
    pub run_toggled: bool,
}

impl PlayerSnapshot {
    pub fn capture(player: &Player) -> Self {
        Self {
            username: player.username.clone(),
            position: player.core.position,
            rights: player.rights,
            appearance: player.appearance.clone(),
            run_energy: player.run_energy,
            run_toggled: player.core.movement.is_run_toggled(),
        }
    }

    /// Copies the saved state onto a freshly created player. Rights are left
    /// alone; they come from the server configuration.
    pub fn restore(&self, player: &mut Player) {
        player.core.position = self.position;
        player.appearance = self.appearance.clone();
        player.run_energy = self.run_energy;
        player.core.movement.set_running(self.run_toggled);
    }
}

/// Runs once during graceful shutdown, after the engine has stopped.
pub trait ShutdownHook: Send + Sync {
    fn on_shutdown(&self, world: &World) -> Result<(), PersistenceError>;
}

/// Stores one bincode file per player under a directory.
#[derive(Debug, Clone)]
pub struct SnapshotSaver {
    dir: PathBuf,
}

impl SnapshotSaver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, username: &str) -> PathBuf {
        let file = username.trim().to_lowercase().replace(' ', "_");
        self.dir.join(format!("{}.bin", file))
    }

    pub fn save(&self, snapshot: &PlayerSnapshot) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.dir).map_err(|source| PersistenceError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.path_for(&snapshot.username);
        let bytes = bincode::serialize(snapshot)?;
        fs::write(&path, bytes).map_err(|source| PersistenceError::Io { path, source })
    }

    /// Reads a player's snapshot; `None` when they were never saved.
    pub fn load(&self, username: &str) -> Result<Option<PlayerSnapshot>, PersistenceError> {
        let path = self.path_for(username);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PersistenceError::Io { path, source }),
        }
    }
}

impl ShutdownHook for SnapshotSaver {
    fn on_shutdown(&self, world: &World) -> Result<(), PersistenceError> {
        let mut saved = 0;
        for (_, player) in world.players.iter() {
            match self.save(&PlayerSnapshot::capture(player)) {
                Ok(()) => saved += 1,
                Err(e) => warn!("Failed to save '{}': {}", player.username, e),
            }
        }
        info!("Saved {} player(s) to {}", saved, self.dir.display());
        Ok(())
    }
}
