//! Store abstraction for membank's state management.
//!
//! A [`Store`] is the session handle every operation receives. It pairs the
//! store root (`<project>/.membank/data`) with a [`StoreBackend`] that owns the
//! actual persistence of knowledge records, requirement documents and plans.
//! The decision log lives beside them in SQLite and is reached through
//! [`crate::core::broker::DbBroker`].

use crate::core::config::{self, MembankConfig, StoreConfig};
use crate::core::error::MembankError;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};
use ulid::Ulid;

pub const PROJECT_DIR: &str = ".membank";
pub const DATA_DIR: &str = "data";
const LOCK_DIR: &str = ".locks";

/// Read-modify-write callback run inside [`StoreBackend::update`]'s critical section.
///
/// Receives the currently stored content (if any) and returns the content to
/// write, or an error to reject the write and leave the stored value untouched.
pub type UpdateFn<'a> = dyn FnMut(Option<&str>) -> Result<String, MembankError> + 'a;

/// Persistence seam. Paths are store-relative and `/`-separated.
pub trait StoreBackend: Send + Sync + fmt::Debug {
    /// Returns `None` when nothing is stored at `rel`.
    fn load(&self, rel: &str) -> Result<Option<String>, MembankError>;

    /// Atomic replace: readers observe either the old or the new content.
    fn save(&self, rel: &str, content: &str) -> Result<(), MembankError>;

    /// Sorted stems of entries in `dir` ending with `.{ext}`.
    fn list(&self, dir: &str, ext: &str) -> Result<Vec<String>, MembankError>;

    /// Exclusive per-path read-check-write. Concurrent updaters of the same
    /// path are serialised; a rejected update writes nothing.
    fn update(&self, rel: &str, apply: &mut UpdateFn<'_>) -> Result<(), MembankError>;
}

/// Flat-file backend: one file per record, temp-file + rename for atomicity,
/// lock files in `.locks/` for [`StoreBackend::update`].
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
    lock_timeout: Duration,
    stale_lock: Duration,
}

impl FsBackend {
    pub fn new(root: &Path, settings: &StoreConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            lock_timeout: Duration::from_millis(settings.lock_timeout_ms),
            stale_lock: Duration::from_millis(settings.stale_lock_ms),
        }
    }

    fn resolve(&self, rel: &str) -> Result<PathBuf, MembankError> {
        if rel.is_empty()
            || rel.starts_with('/')
            || rel.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
        {
            return Err(MembankError::PathError(format!(
                "invalid store-relative path '{rel}'"
            )));
        }
        Ok(self.root.join(rel))
    }

    fn lock_path(&self, rel: &str) -> PathBuf {
        self.root
            .join(LOCK_DIR)
            .join(format!("{}.lock", rel.replace('/', "__")))
    }

    fn acquire(&self, rel: &str) -> Result<LockGuard, MembankError> {
        let path = self.lock_path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(MembankError::IoError)?;
        }
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let token = Ulid::new().to_string();
                    if let Err(e) = file.write_all(token.as_bytes()) {
                        let _ = fs::remove_file(&path);
                        return Err(MembankError::IoError(e));
                    }
                    return Ok(LockGuard { path, token });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if self.lock_is_stale(&path) {
                        let broken = remove_lock_if(&path, |moved| self.lock_is_stale(moved))
                            .map_err(MembankError::IoError)?;
                        if broken {
                            warn!(lock = %path.display(), "broke stale store lock");
                        }
                        continue;
                    }
                    if started.elapsed() >= self.lock_timeout {
                        return Err(MembankError::IoError(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("timed out waiting for lock on '{rel}'"),
                        )));
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(MembankError::IoError(e)),
            }
        }
    }

    fn lock_is_stale(&self, path: &Path) -> bool {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age > self.stale_lock)
    }
}

/// Moves the lock at `path` aside and deletes it when `remove` accepts the
/// moved file, otherwise links it back. The rename makes the check and the
/// removal act on the same file even if the lock changes hands meanwhile.
fn remove_lock_if(path: &Path, remove: impl FnOnce(&Path) -> bool) -> io::Result<bool> {
    let aside = path.with_extension(format!("lock.{}.aside", Ulid::new()));
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    }
    if remove(&aside) {
        fs::remove_file(&aside)?;
        return Ok(true);
    }
    let restored = fs::hard_link(&aside, path);
    fs::remove_file(&aside)?;
    match restored {
        Ok(()) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

struct LockGuard {
    path: PathBuf,
    token: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let token = self.token.as_str();
        match remove_lock_if(&self.path, |moved| {
            fs::read_to_string(moved).is_ok_and(|held| held.trim() == token)
        }) {
            Ok(true) => {}
            Ok(false) => warn!(lock = %self.path.display(), "store lock changed owner before release"),
            Err(e) => warn!(lock = %self.path.display(), error = %e, "failed to release store lock"),
        }
    }
}

/// Write `content` next to `path` and rename it into place.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<(), MembankError> {
    let parent = path.parent().ok_or_else(|| {
        MembankError::PathError(format!("no parent directory for {}", path.display()))
    })?;
    fs::create_dir_all(parent).map_err(MembankError::IoError)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, Ulid::new()));
    {
        let mut file = fs::File::create(&tmp).map_err(MembankError::IoError)?;
        file.write_all(content).map_err(MembankError::IoError)?;
        file.sync_all().map_err(MembankError::IoError)?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(MembankError::IoError(e));
    }
    Ok(())
}

impl StoreBackend for FsBackend {
    fn load(&self, rel: &str) -> Result<Option<String>, MembankError> {
        let path = self.resolve(rel)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(MembankError::IoError(e)),
        };
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| MembankError::corrupted(rel, format!("not valid UTF-8: {e}")))
    }

    fn save(&self, rel: &str, content: &str) -> Result<(), MembankError> {
        let path = self.resolve(rel)?;
        atomic_write(&path, content.as_bytes())?;
        debug!(path = rel, bytes = content.len(), "store.save");
        Ok(())
    }

    fn list(&self, dir: &str, ext: &str) -> Result<Vec<String>, MembankError> {
        let path = self.resolve(dir)?;
        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MembankError::IoError(e)),
        };
        let suffix = format!(".{ext}");
        let mut stems = Vec::new();
        for entry in entries {
            let entry = entry.map_err(MembankError::IoError)?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.path().is_file() {
                continue;
            }
            if let Some(stem) = name.strip_suffix(&suffix) {
                stems.push(stem.to_string());
            }
        }
        stems.sort();
        Ok(stems)
    }

    fn update(&self, rel: &str, apply: &mut UpdateFn<'_>) -> Result<(), MembankError> {
        let path = self.resolve(rel)?;
        let _guard = self.acquire(rel)?;
        let current = self.load(rel)?;
        let next = apply(current.as_deref())?;
        atomic_write(&path, next.as_bytes())?;
        debug!(path = rel, bytes = next.len(), "store.update");
        Ok(())
    }
}

/// Store handle representing one project's membank state.
///
/// Opened once per session and passed explicitly into every operation.
#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute path to the store root directory
    pub root: PathBuf,
    /// Configuration in effect for this session
    pub config: MembankConfig,
    backend: Arc<dyn StoreBackend>,
}

impl Store {
    /// Open the store of a project (the directory containing `.membank/`).
    pub fn open(project_root: &Path) -> Result<Self, MembankError> {
        let config = config::load_config(project_root)?;
        let root = project_root.join(PROJECT_DIR).join(DATA_DIR);
        Ok(Self::with_config(&root, config))
    }

    /// Store over an explicit root with default configuration.
    pub fn at(root: &Path) -> Self {
        Self::with_config(root, MembankConfig::default())
    }

    pub fn with_config(root: &Path, config: MembankConfig) -> Self {
        let backend = Arc::new(FsBackend::new(root, &config.store));
        Self {
            root: root.to_path_buf(),
            config,
            backend,
        }
    }

    /// Substitute the persistence backend; the decision log stays under `root`.
    pub fn with_backend(root: &Path, config: MembankConfig, backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            root: root.to_path_buf(),
            config,
            backend,
        }
    }

    pub fn backend(&self) -> &dyn StoreBackend {
        self.backend.as_ref()
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }
}

/// Walk up from `start_dir` until a directory containing `.membank/` is found.
pub fn find_project_root(start_dir: &Path) -> Result<PathBuf, MembankError> {
    let mut current_dir = PathBuf::from(start_dir);
    loop {
        if current_dir.join(PROJECT_DIR).is_dir() {
            return Ok(current_dir);
        }
        if !current_dir.pop() {
            return Err(MembankError::NotFound(
                "'.membank' directory not found in current or parent directories. Run `membank init` first.".to_string(),
            ));
        }
    }
}

/// Create `.membank/` with its data directories and a default config file.
pub fn init_project(project_root: &Path) -> Result<Store, MembankError> {
    let membank_dir = project_root.join(PROJECT_DIR);
    let data = membank_dir.join(DATA_DIR);
    for sub in ["knowledge", "requirements", "plans"] {
        fs::create_dir_all(data.join(sub)).map_err(MembankError::IoError)?;
    }
    let config_path = config::config_path(project_root);
    if !config_path.exists() {
        atomic_write(&config_path, config::render_default_config()?.as_bytes())?;
    }
    Store::open(project_root)
}
