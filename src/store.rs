use std::{
    collections::HashMap,
    fs,
    io::{ErrorKind, Write as _},
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;

use crate::{config::ConfigurationError, fingerprint::Fingerprint, interaction::Interaction};

const FIXTURE_EXTENSION: &str = "json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Created,
    /// Another writer got there first; the existing fixture was left as is.
    AlreadyPresent,
}

#[derive(Debug)]
pub enum StoreError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Corrupt {
        path: PathBuf,
        reason: String,
    },
    Serialize(serde_json::Error),
    Internal(String),
}

impl StoreError {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Io { .. } => "io",
            Self::Corrupt { .. } => "corrupt_fixture",
            Self::Serialize(_) => "serialize",
            Self::Internal(_) => "internal",
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "fixture I/O on {}: {source}", path.display()),
            Self::Corrupt { path, reason } => {
                write!(f, "corrupt fixture {}: {reason}", path.display())
            }
            Self::Serialize(err) => write!(f, "serialize fixture: {err}"),
            Self::Internal(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Serialize(source) => Some(source),
            Self::Corrupt { .. } | Self::Internal(_) => None,
        }
    }
}

/// Key-addressed store of recorded interactions.
///
/// Entries are immutable: `persist` never replaces an existing fingerprint.
#[async_trait]
pub trait FixtureStore: Send + Sync {
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<Interaction>, StoreError>;

    async fn persist(
        &self,
        fingerprint: &Fingerprint,
        interaction: &Interaction,
    ) -> Result<PersistOutcome, StoreError>;
}

/// One pretty-printed JSON file per fingerprint, `<dir>/<fingerprint>.json`.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    dir: PathBuf,
}

impl DirectoryStore {
    /// Opens (creating if needed) a fixture directory and checks that it is writable.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ConfigurationError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| {
            ConfigurationError::new(format!("create fixture dir {}: {err}", dir.display()))
        })?;
        if !dir.is_dir() {
            return Err(ConfigurationError::new(format!(
                "fixture path {} is not a directory",
                dir.display()
            )));
        }
        tempfile::Builder::new()
            .prefix(".tapedeck-probe")
            .tempfile_in(&dir)
            .map_err(|err| {
                ConfigurationError::new(format!(
                    "fixture dir {} is not writable: {err}",
                    dir.display()
                ))
            })?;

        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn fixture_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir
            .join(format!("{}.{FIXTURE_EXTENSION}", fingerprint.as_str()))
    }
}

#[async_trait]
impl FixtureStore for DirectoryStore {
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<Interaction>, StoreError> {
        let path = self.fixture_path(fingerprint);
        tokio::task::spawn_blocking(move || lookup_blocking(&path))
            .await
            .map_err(|err| StoreError::Internal(format!("join fixture lookup task failed: {err}")))?
    }

    async fn persist(
        &self,
        fingerprint: &Fingerprint,
        interaction: &Interaction,
    ) -> Result<PersistOutcome, StoreError> {
        if interaction.response.is_none() {
            return Err(StoreError::Internal(
                "refusing to persist an interaction without a response".to_owned(),
            ));
        }

        let mut document = serde_json::to_vec_pretty(interaction).map_err(StoreError::Serialize)?;
        document.push(b'\n');
        let dir = self.dir.clone();
        let path = self.fixture_path(fingerprint);
        tokio::task::spawn_blocking(move || persist_blocking(&dir, &path, &document))
            .await
            .map_err(|err| {
                StoreError::Internal(format!("join fixture persist task failed: {err}"))
            })?
    }
}

fn lookup_blocking(path: &Path) -> Result<Option<Interaction>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let interaction: Interaction =
        serde_json::from_slice(&bytes).map_err(|err| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
    if interaction.response.is_none() {
        return Err(StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: "fixture has no response".to_owned(),
        });
    }
    Ok(Some(interaction))
}

fn persist_blocking(dir: &Path, path: &Path, document: &[u8]) -> Result<PersistOutcome, StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    // Written beside the target, then linked into place so readers never see partial files.
    let mut staged = tempfile::Builder::new()
        .prefix(".tapedeck-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(io_err)?;
    staged.write_all(document).map_err(io_err)?;
    staged.as_file().sync_all().map_err(io_err)?;

    match staged.persist_noclobber(path) {
        Ok(_) => Ok(PersistOutcome::Created),
        Err(err) if err.error.kind() == ErrorKind::AlreadyExists => {
            Ok(PersistOutcome::AlreadyPresent)
        }
        Err(err) => Err(io_err(err.error)),
    }
}

/// In-memory store with the same contract as [`DirectoryStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<Fingerprint, Interaction>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Interaction> {
        self.lock().get(fingerprint).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Fingerprint, Interaction>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl FixtureStore for MemoryStore {
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<Interaction>, StoreError> {
        Ok(self.get(fingerprint))
    }

    async fn persist(
        &self,
        fingerprint: &Fingerprint,
        interaction: &Interaction,
    ) -> Result<PersistOutcome, StoreError> {
        if interaction.response.is_none() {
            return Err(StoreError::Internal(
                "refusing to persist an interaction without a response".to_owned(),
            ));
        }

        let mut entries = self.lock();
        if entries.contains_key(fingerprint) {
            return Ok(PersistOutcome::AlreadyPresent);
        }
        entries.insert(fingerprint.clone(), interaction.clone());
        Ok(PersistOutcome::Created)
    }
}
