//! box-store — the filesystem-backed queue store.
//!
//! One directory per queue under `<root>/queues`, one JSON file per object.
//! Writes go to a sibling temporary name and are published by rename, so a
//! reader never observes a partial object. Ordinary queues name files
//! `<timestamp>-<uuid>.json` (zero-padded millisecond timestamp, so
//! lexicographic order is chronological); `whoswho` names files
//! `<subject-uuid>.json` and replaces in place.
//!
//! The store is synchronous and never retries: callers decide policy.

use std::collections::HashSet;
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use uuid::Uuid;

use box_core::object::{ObjectRef, StoredObject};
use box_core::queue::QueuePath;

/// Directory mode for the storage root and every queue.
const DIR_MODE: u32 = 0o700;

/// Durable, process-local object store with permanent-queue semantics.
pub struct QueueStore {
    root: PathBuf,
    permanent: HashSet<String>,
}

/// Filesystem summary reported over the admin channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreMetrics {
    pub free_bytes: u64,
    pub queue_count: usize,
    pub object_count: usize,
}

impl QueueStore {
    /// Open (and create if needed) the store rooted at `root`.
    ///
    /// `permanent` lists queues whose GET never removes; `whoswho` is
    /// treated as permanent whether or not it appears there.
    pub fn open(
        root: impl Into<PathBuf>,
        permanent: impl IntoIterator<Item = String>,
    ) -> Result<Self, StoreError> {
        let root = root.into();
        create_dir_restricted(&root)?;
        Ok(Self {
            root,
            permanent: permanent.into_iter().collect(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A queue is permanent iff configured so or it is `whoswho`.
    pub fn is_permanent(&self, queue: &QueuePath) -> bool {
        queue.is_whoswho() || self.permanent.contains(queue.as_str())
    }

    /// Idempotently provision a queue directory (mode 0700).
    pub fn ensure_queue(&self, queue: &QueuePath) -> Result<PathBuf, StoreError> {
        let dir = queue.dir_under(&self.root);
        let mut ancestor = self.root.clone();
        for segment in queue.segments() {
            ancestor.push(segment);
            create_dir_restricted(&ancestor)?;
        }
        Ok(dir)
    }

    /// Write an object and publish it atomically. Returns its reference.
    ///
    /// In `whoswho` the file is named after the object id, so a later put
    /// for the same subject replaces the record in place.
    pub fn put(&self, queue: &QueuePath, object: &StoredObject) -> Result<ObjectRef, StoreError> {
        let dir = self.ensure_queue(queue)?;
        let filename = if queue.is_whoswho() {
            format!("{}.json", object.id)
        } else {
            format!(
                "{:013}-{}.json",
                object.created_at.timestamp_millis(),
                object.id
            )
        };

        let value = serde_json::to_value(object).map_err(|e| StoreError::Codec {
            path: dir.join(&filename),
            source: e,
        })?;
        let text = serde_json::to_string_pretty(&value).map_err(|e| StoreError::Codec {
            path: dir.join(&filename),
            source: e,
        })?;

        let final_path = dir.join(&filename);
        let tmp_path = dir.join(format!(".{filename}.{:08x}.tmp", rand::random::<u32>()));
        fs::write(&tmp_path, text).map_err(|e| StoreError::Io {
            path: tmp_path.clone(),
            source: e,
        })?;
        fs::rename(&tmp_path, &final_path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            StoreError::Io {
                path: final_path.clone(),
                source: e,
            }
        })?;

        tracing::debug!(queue = %queue, id = %object.id, file = %filename, "object stored");
        Ok(ObjectRef {
            id: object.id,
            url: object_url(queue, &filename),
            created_at: object.created_at,
        })
    }

    /// Read the newest object. Removes it afterwards unless the queue is
    /// permanent.
    pub fn get_latest(&self, queue: &QueuePath) -> Result<StoredObject, StoreError> {
        let dir = self.queue_dir_existing(queue)?;
        let filename = self
            .object_files(&dir)?
            .into_iter()
            .last()
            .ok_or_else(|| StoreError::ObjectNotFound(queue.to_string()))?;
        let path = dir.join(&filename);
        let object = read_object(&path)?;

        if !self.is_permanent(queue) {
            fs::remove_file(&path).map_err(|e| StoreError::Io {
                path: path.clone(),
                source: e,
            })?;
            tracing::debug!(queue = %queue, id = %object.id, "object consumed");
        }
        Ok(object)
    }

    /// Enumerate all objects, sorted lexicographically by filename.
    pub fn list(&self, queue: &QueuePath) -> Result<Vec<ObjectRef>, StoreError> {
        let dir = self.queue_dir_existing(queue)?;
        let mut refs = Vec::new();
        for filename in self.object_files(&dir)? {
            let object = read_object(&dir.join(&filename))?;
            refs.push(ObjectRef {
                id: object.id,
                url: object_url(queue, &filename),
                created_at: object.created_at,
            });
        }
        Ok(refs)
    }

    /// Read an object by reference.
    pub fn read(&self, reference: &ObjectRef) -> Result<StoredObject, StoreError> {
        let (queue, filename) = parse_object_url(&reference.url)?;
        let path = queue.dir_under(&self.root).join(filename);
        if !path.is_file() {
            return Err(StoreError::ObjectNotFound(reference.url.clone()));
        }
        read_object(&path)
    }

    /// Best-effort removal by object id.
    pub fn remove(&self, queue: &QueuePath, id: Uuid) -> Result<(), StoreError> {
        let dir = self.queue_dir_existing(queue)?;
        let needle = if queue.is_whoswho() {
            format!("{id}.json")
        } else {
            format!("-{id}.json")
        };
        for filename in self.object_files(&dir)? {
            let matched = if queue.is_whoswho() {
                filename == needle
            } else {
                filename.ends_with(&needle)
            };
            if matched {
                let path = dir.join(&filename);
                fs::remove_file(&path).map_err(|e| StoreError::Io { path, source: e })?;
                tracing::debug!(queue = %queue, %id, "object removed");
                return Ok(());
            }
        }
        Err(StoreError::ObjectNotFound(id.to_string()))
    }

    /// Filesystem summary: free space, queue directories, stored objects.
    pub fn metrics(&self) -> Result<StoreMetrics, StoreError> {
        let mut queue_count = 0usize;
        let mut object_count = 0usize;
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            for entry in read_dir(&dir)? {
                let entry = entry.map_err(|e| StoreError::Io {
                    path: dir.clone(),
                    source: e,
                })?;
                let path = entry.path();
                if path.is_dir() {
                    queue_count += 1;
                    stack.push(path);
                } else if is_object_file(&path) {
                    object_count += 1;
                }
            }
        }
        Ok(StoreMetrics {
            free_bytes: free_bytes(&self.root)?,
            queue_count,
            object_count,
        })
    }

    fn queue_dir_existing(&self, queue: &QueuePath) -> Result<PathBuf, StoreError> {
        let dir = queue.dir_under(&self.root);
        if !dir.is_dir() {
            return Err(StoreError::QueueNotFound(queue.to_string()));
        }
        Ok(dir)
    }

    /// Object filenames in a queue directory, sorted lexicographically.
    /// Temporary files and subdirectories are skipped.
    fn object_files(&self, dir: &Path) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        for entry in read_dir(dir)? {
            let entry = entry.map_err(|e| StoreError::Io {
                path: dir.to_path_buf(),
                source: e,
            })?;
            let path = entry.path();
            if is_object_file(&path) {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    names.push(name.to_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn create_dir_restricted(dir: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(dir).map_err(|e| StoreError::Io {
        path: dir.to_path_buf(),
        source: e,
    })?;
    fs::set_permissions(dir, fs::Permissions::from_mode(DIR_MODE)).map_err(|e| StoreError::Io {
        path: dir.to_path_buf(),
        source: e,
    })
}

fn read_dir(dir: &Path) -> Result<fs::ReadDir, StoreError> {
    fs::read_dir(dir).map_err(|e| StoreError::Io {
        path: dir.to_path_buf(),
        source: e,
    })
}

fn is_object_file(path: &Path) -> bool {
    path.is_file()
        && path.extension().map_or(false, |ext| ext == "json")
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| !n.starts_with('.'))
}

fn read_object(path: &Path) -> Result<StoredObject, StoreError> {
    let text = fs::read_to_string(path).map_err(|e| StoreError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_str(&text).map_err(|e| StoreError::Codec {
        path: path.to_path_buf(),
        source: e,
    })
}

fn object_url(queue: &QueuePath, filename: &str) -> String {
    format!("box://{queue}/{filename}")
}

fn parse_object_url(url: &str) -> Result<(QueuePath, String), StoreError> {
    let rest = url
        .strip_prefix("box://")
        .ok_or_else(|| StoreError::BadReference(url.to_owned()))?;
    let (queue, filename) = rest
        .rsplit_once('/')
        .ok_or_else(|| StoreError::BadReference(url.to_owned()))?;
    if filename.is_empty() || filename.contains("..") {
        return Err(StoreError::BadReference(url.to_owned()));
    }
    let queue = QueuePath::parse(queue).map_err(|_| StoreError::BadReference(url.to_owned()))?;
    Ok((queue, filename.to_owned()))
}

/// Free bytes on the filesystem holding `path`, via statvfs.
fn free_bytes(path: &Path) -> Result<u64, StoreError> {
    let c_path = CString::new(path.as_os_str().as_encoded_bytes()).map_err(|_| StoreError::Io {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"),
    })?;
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) };
    if rc != 0 {
        return Err(StoreError::Io {
            path: path.to_path_buf(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(stats.f_bavail as u64 * stats.f_frsize as u64)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("I/O failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("object codec failure at {path}: {source}")]
    Codec {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed object reference: {0}")]
    BadReference(String),
}

impl StoreError {
    /// True for the two "nothing there" failures, which many callers
    /// tolerate (remove-before-write, optimistic reads).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::QueueNotFound(_) | StoreError::ObjectNotFound(_)
        )
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
