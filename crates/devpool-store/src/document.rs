//! Locked JSON registry documents
//!
//! A document is opened under an exclusive advisory lock held on a sibling
//! `<document>.lock` file. Changes become visible to other invocations only
//! through [`DocumentGuard::commit`], which writes a temp file and renames it
//! over the document.
//!
//! The registries are shared by every user on the host: the state directory
//! is created `0777` and lock files and documents `0666`, regardless of the
//! umask. The directory must not carry the sticky bit, otherwise a commit
//! could not rename over a document last written by another user.

use devpool_core::{DevpoolError, DevpoolResult};
use fs2::FileExt;
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[cfg(unix)]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};

/// Mode of a state directory created by devpool
pub const STATE_DIR_MODE: u32 = 0o777;

/// Mode of lock files and documents
pub const SHARED_FILE_MODE: u32 = 0o666;

/// Location of one registry document
#[derive(Debug, Clone)]
pub struct DocumentStore<T> {
    path: PathBuf,
    lock_path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> DocumentStore<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);

        Self {
            path,
            lock_path,
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the document has been created. Only advisory: the answer can
    /// change before the next [`open`](Self::open).
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Lock the document and load it.
    ///
    /// Blocks until no other invocation holds the lock. `init` builds the
    /// document when it does not exist yet or when `reset` is set.
    pub fn open<F>(&self, init: F, reset: bool) -> DevpoolResult<DocumentGuard<T>>
    where
        F: FnOnce() -> DevpoolResult<T>,
    {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                create_state_dir(parent)?;
                info!(path = %parent.display(), "Created state directory");
            }
        }

        let lock = self.acquire_lock()?;

        let (doc, created) = if reset {
            info!(path = %self.path.display(), "Resetting document");
            (init()?, true)
        } else {
            match self.load()? {
                Some(doc) => (doc, false),
                None => (init()?, true),
            }
        };

        Ok(DocumentGuard {
            doc,
            path: self.path.clone(),
            lock,
            created,
        })
    }

    /// Open, mutate and commit in one scope.
    ///
    /// Nothing is persisted when `f` fails.
    pub fn transact<I, F, R>(&self, init: I, reset: bool, f: F) -> DevpoolResult<R>
    where
        I: FnOnce() -> DevpoolResult<T>,
        F: FnOnce(&mut T) -> DevpoolResult<R>,
    {
        let mut guard = self.open(init, reset)?;
        let result = f(&mut guard)?;
        guard.commit()?;
        Ok(result)
    }

    fn acquire_lock(&self) -> DevpoolResult<File> {
        let created = !self.lock_path.exists();
        let file = shared_options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| {
                DevpoolError::Lock(format!(
                    "Failed to open lock file {}: {}",
                    self.lock_path.display(),
                    e
                ))
            })?;
        if created {
            share_file(&self.lock_path);
        }

        FileExt::lock_exclusive(&file).map_err(|e| {
            DevpoolError::Lock(format!(
                "Failed to lock {}: {}",
                self.lock_path.display(),
                e
            ))
        })?;
        debug!(path = %self.lock_path.display(), "Acquired document lock");

        Ok(file)
    }

    fn load(&self) -> DevpoolResult<Option<T>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            warn!(path = %self.path.display(), "Document is empty, recreating");
            return Ok(None);
        }

        serde_json::from_str(&contents).map(Some).map_err(|e| {
            DevpoolError::Storage(format!("Failed to parse {}: {}", self.path.display(), e))
        })
    }
}

/// An open document, exclusively locked until dropped
pub struct DocumentGuard<T: Serialize> {
    doc: T,
    path: PathBuf,
    lock: File,
    created: bool,
}

impl<T: Serialize> DocumentGuard<T> {
    /// Whether the document was built by `init` in this scope
    pub fn is_new(&self) -> bool {
        self.created
    }

    /// Persist the document atomically and release the lock
    pub fn commit(self) -> DevpoolResult<()> {
        let serialized = serde_json::to_string_pretty(&self.doc)?;
        let temp_path = self
            .path
            .with_extension(format!("json.{}.tmp", std::process::id()));

        {
            let mut file = shared_options()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .map_err(|e| {
                    DevpoolError::Storage(format!(
                        "Failed to create temp file {}: {}",
                        temp_path.display(),
                        e
                    ))
                })?;
            file.write_all(serialized.as_bytes())?;
            file.sync_all()?;
        }
        share_file(&temp_path);

        if let Err(e) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(DevpoolError::Storage(format!(
                "Failed to replace {}: {}",
                self.path.display(),
                e
            )));
        }

        debug!(path = %self.path.display(), "Committed document");
        Ok(())
    }
}

fn create_state_dir(path: &Path) -> DevpoolResult<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        builder.mode(STATE_DIR_MODE);
    }
    builder.create(path).map_err(|e| {
        DevpoolError::Storage(format!(
            "Failed to create state directory {}: {}",
            path.display(),
            e
        ))
    })?;

    // The umask applies to mkdir
    #[cfg(unix)]
    {
        fs::set_permissions(path, fs::Permissions::from_mode(STATE_DIR_MODE))?;
    }
    Ok(())
}

fn shared_options() -> OpenOptions {
    #[allow(unused_mut)]
    let mut options = OpenOptions::new();
    #[cfg(unix)]
    {
        options.mode(SHARED_FILE_MODE);
    }
    options
}

/// Widen a file this invocation created past the umask. Only the owner may
/// change the mode, so a failure is logged and otherwise ignored.
fn share_file(path: &Path) {
    #[cfg(unix)]
    {
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(SHARED_FILE_MODE)) {
            warn!(path = %path.display(), error = %e, "Failed to widen file permissions");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

impl<T: Serialize> Deref for DocumentGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.doc
    }
}

impl<T: Serialize> DerefMut for DocumentGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.doc
    }
}

impl<T: Serialize> Drop for DocumentGuard<T> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.lock) {
            warn!(path = %self.path.display(), error = %e, "Failed to release document lock");
        }
    }
}
