//! CLI configuration file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notesync_common::DeviceIdentity;
use notesync_storage::{HttpRemoteStore, LocalStore, MemoryBackend, OwnerSession, RemoteStore};
use notesync_sync::{SyncConfig, SyncManager};

const APP_DIR: &str = "notesync";

/// Where the remote lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteConfig {
    /// Remote kept in a JSON file on this machine. Configs pointing at
    /// the same file share it like devices sharing a server.
    File { path: PathBuf },
    /// PostgREST endpoint.
    Http {
        base_url: String,
        api_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access_token: Option<String>,
    },
}

/// Contents of `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    pub database: PathBuf,
    pub identity: DeviceIdentity,
    pub remote: RemoteConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

/// A manager plus whatever must be flushed when the command ends.
pub struct Session {
    pub manager: Arc<SyncManager>,
    file_remote: Option<(Arc<MemoryBackend>, PathBuf)>,
}

impl Session {
    /// Save a file-backed remote. Call after anything that talked to it.
    pub fn persist(&self) -> Result<()> {
        if let Some((backend, path)) = &self.file_remote {
            backend
                .save(path)
                .with_context(|| format!("Failed to save remote {}", path.display()))?;
        }
        Ok(())
    }
}

impl CliConfig {
    pub fn new(identity: DeviceIdentity, remote: RemoteConfig) -> Self {
        Self {
            database: default_database_path(),
            identity,
            remote,
            sync: SyncConfig::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).with_context(|| {
            format!(
                "Failed to read config {} (run `notesync init` first)",
                path.display()
            )
        })?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw).with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Open the local store.
    pub fn open_store(&self) -> Result<LocalStore> {
        if let Some(parent) = self.database.parent() {
            fs::create_dir_all(parent).context("Failed to create data directory")?;
        }
        LocalStore::open(&self.database)
            .with_context(|| format!("Failed to open database {}", self.database.display()))
    }

    /// Open the store and wire up a sync manager.
    pub fn session(&self) -> Result<Session> {
        let store = Arc::new(self.open_store()?);
        let owner_session = OwnerSession::new(self.identity.owner_id.clone());

        let (remote, file_remote): (Arc<dyn RemoteStore>, _) = match &self.remote {
            RemoteConfig::File { path } => {
                let backend = MemoryBackend::load(path)
                    .with_context(|| format!("Failed to load remote {}", path.display()))?;
                let remote = backend.connect(owner_session);
                (Arc::new(remote), Some((backend, path.clone())))
            }
            RemoteConfig::Http {
                base_url,
                api_key,
                access_token,
            } => {
                let owner_session = match access_token {
                    Some(token) => owner_session.with_token(token.clone()),
                    None => owner_session,
                };
                let remote = HttpRemoteStore::new(
                    base_url,
                    api_key.clone(),
                    owner_session,
                    self.sync.request_timeout,
                )
                .context("Failed to create HTTP remote")?;
                (Arc::new(remote), None)
            }
        };

        let manager = SyncManager::new(store, remote, self.identity.clone(), self.sync.clone())
            .context("Failed to create sync manager")?;
        Ok(Session {
            manager: Arc::new(manager),
            file_remote,
        })
    }
}

/// `<config dir>/notesync/config.json`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("config.json")
}

/// `<data dir>/notesync/notes.db`.
pub fn default_database_path() -> PathBuf {
    data_dir().join("notes.db")
}

/// `<data dir>/notesync/remote.json`.
pub fn default_remote_path() -> PathBuf {
    data_dir().join("remote.json")
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}
