//! Filesystem destination
//!
//! Objects live at `root/bucket/object`. Creation uses `O_CREAT | O_EXCL`
//! so an existing object is reported as [`UploadError::AlreadyExists`]
//! without a separate existence check.
//!
//! Directories created for an upload are remembered until it finalizes.
//! Discarding the object removes them again if they are still empty.

use super::{Destination, Sink};
use crate::config::StorageConfig;
use crate::upload::{ObjectIdentity, UploadError};
use dashmap::DashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Directories created by in-flight uploads, deepest first
type CreatedDirs = Arc<DashMap<ObjectIdentity, Vec<PathBuf>>>;

/// Destination backed by a directory tree
#[derive(Debug, Clone)]
pub struct FsDestination {
    root: PathBuf,
    create_buckets: bool,
    sync_on_finalize: bool,
    created: CreatedDirs,
}

impl FsDestination {
    /// Create a destination rooted at `root`, creating buckets on demand
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            create_buckets: true,
            sync_on_finalize: true,
            created: CreatedDirs::default(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            root: config.root.clone(),
            create_buckets: config.create_buckets,
            sync_on_finalize: config.sync_on_finalize,
            created: CreatedDirs::default(),
        }
    }

    pub fn with_create_buckets(mut self, create_buckets: bool) -> Self {
        self.create_buckets = create_buckets;
        self
    }

    pub fn with_sync_on_finalize(mut self, sync_on_finalize: bool) -> Self {
        self.sync_on_finalize = sync_on_finalize;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of an object
    pub fn path_for(&self, identity: &ObjectIdentity) -> PathBuf {
        self.root.join(identity.join())
    }

    /// Create the bucket and key directories above `path`.
    ///
    /// Returns the directories that did not exist before, deepest first.
    fn ensure_parent(&self, identity: &ObjectIdentity, path: &Path) -> io::Result<Vec<PathBuf>> {
        let bucket_dir = self.root.join(&identity.bucket);
        if !bucket_dir.is_dir() && !self.create_buckets {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("bucket '{}' does not exist", identity.bucket),
            ));
        }

        let Some(parent) = path.parent() else {
            return Ok(Vec::new());
        };
        let missing: Vec<PathBuf> = parent
            .ancestors()
            .take_while(|dir| *dir != self.root && !dir.exists())
            .map(Path::to_path_buf)
            .collect();

        if let Err(e) = fs::create_dir_all(parent) {
            remove_empty_dirs(&missing);
            return Err(e);
        }
        Ok(missing)
    }
}

/// Remove `dirs` in order, stopping at the first one that is not empty
fn remove_empty_dirs(dirs: &[PathBuf]) {
    for dir in dirs {
        if let Err(e) = fs::remove_dir(dir) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::debug!(dir = %dir.display(), error = %e, "Leaving upload directory in place");
                break;
            }
        }
    }
}

impl Destination for FsDestination {
    type Sink = FsSink;

    fn create_exclusive(
        &self,
        identity: &ObjectIdentity,
        _size: u64,
    ) -> Result<FsSink, UploadError> {
        let path = self.path_for(identity);
        let created = self.ensure_parent(identity, &path)?;

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => {
                if !created.is_empty() {
                    self.created.insert(identity.clone(), created);
                }
                Ok(FsSink {
                    file: BufWriter::new(file),
                    sync: self.sync_on_finalize,
                    identity: identity.clone(),
                    created: Arc::clone(&self.created),
                })
            }
            Err(e) => {
                remove_empty_dirs(&created);
                if e.kind() == io::ErrorKind::AlreadyExists {
                    return Err(UploadError::AlreadyExists {
                        bucket: identity.bucket.clone(),
                        object: identity.object.clone(),
                    });
                }
                Err(e.into())
            }
        }
    }

    fn discard(&self, identity: &ObjectIdentity) -> Result<(), UploadError> {
        match fs::remove_file(self.path_for(identity)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some((_, dirs)) = self.created.remove(identity) {
            remove_empty_dirs(&dirs);
        }
        Ok(())
    }
}

/// Buffered file sink
#[derive(Debug)]
pub struct FsSink {
    file: BufWriter<File>,
    sync: bool,
    identity: ObjectIdentity,
    created: CreatedDirs,
}

impl Write for FsSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Sink for FsSink {
    fn finalize(self) -> Result<(), UploadError> {
        let file = self.file.into_inner().map_err(|e| e.into_error())?;
        if self.sync {
            file.sync_all()?;
        }
        // Committed: the directories now hold a real object.
        self.created.remove(&self.identity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn identity(bucket: &str, object: &str) -> ObjectIdentity {
        ObjectIdentity {
            bucket: bucket.into(),
            object: object.into(),
        }
    }

    #[test]
    fn test_create_write_finalize() {
        let dir = TempDir::new().unwrap();
        let dest = FsDestination::new(dir.path());
        let id = identity("b", "o.txt");

        let mut sink = dest.create_exclusive(&id, 5).unwrap();
        sink.write_all(b"hello").unwrap();
        sink.finalize().unwrap();

        assert_eq!(fs::read(dir.path().join("b/o.txt")).unwrap(), b"hello");
    }

    #[test]
    fn test_existing_object_is_distinguishable() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("b/o.txt"), b"original").unwrap();

        let dest = FsDestination::new(dir.path());
        let err = dest.create_exclusive(&identity("b", "o.txt"), 3).unwrap_err();

        assert!(matches!(err, UploadError::AlreadyExists { .. }));
        assert_eq!(fs::read(dir.path().join("b/o.txt")).unwrap(), b"original");
    }

    #[test]
    fn test_missing_bucket_without_create() {
        let dir = TempDir::new().unwrap();
        let dest = FsDestination::new(dir.path()).with_create_buckets(false);
        let err = dest.create_exclusive(&identity("nope", "o"), 1).unwrap_err();

        assert!(matches!(err, UploadError::IoError(ref e) if e.kind() == io::ErrorKind::NotFound));
    }

    #[test]
    fn test_nested_object_key() {
        let dir = TempDir::new().unwrap();
        let dest = FsDestination::new(dir.path()).with_sync_on_finalize(false);
        let id = identity("b", "x/y/z.bin");

        let mut sink = dest.create_exclusive(&id, 2).unwrap();
        sink.write_all(b"ok").unwrap();
        sink.finalize().unwrap();

        assert!(dest.path_for(&id).is_file());
    }

    #[test]
    fn test_discard_removes_directories_it_created() {
        let dir = TempDir::new().unwrap();
        let dest = FsDestination::new(dir.path());
        let id = identity("b", "x/y/z.bin");

        drop(dest.create_exclusive(&id, 4).unwrap());
        assert!(dir.path().join("b/x/y").is_dir());

        dest.discard(&id).unwrap();
        assert!(!dir.path().join("b").exists());
        assert!(dir.path().exists());
    }

    #[test]
    fn test_discard_keeps_existing_directories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("b/x")).unwrap();
        let dest = FsDestination::new(dir.path());
        let id = identity("b", "x/y/z.bin");

        drop(dest.create_exclusive(&id, 4).unwrap());
        dest.discard(&id).unwrap();

        assert!(!dir.path().join("b/x/y").exists());
        assert!(dir.path().join("b/x").is_dir());
    }

    #[test]
    fn test_discard_keeps_directory_shared_with_another_object() {
        let dir = TempDir::new().unwrap();
        let dest = FsDestination::new(dir.path()).with_sync_on_finalize(false);
        let failed = identity("b", "failed");
        let kept = identity("b", "kept");

        drop(dest.create_exclusive(&failed, 1).unwrap());
        let mut sink = dest.create_exclusive(&kept, 2).unwrap();
        sink.write_all(b"ok").unwrap();
        sink.finalize().unwrap();

        dest.discard(&failed).unwrap();
        assert_eq!(fs::read(dest.path_for(&kept)).unwrap(), b"ok");
    }

    #[test]
    fn test_finalized_object_keeps_its_directories() {
        let dir = TempDir::new().unwrap();
        let dest = FsDestination::new(dir.path()).with_sync_on_finalize(false);
        let id = identity("b", "o");

        dest.create_exclusive(&id, 0).unwrap().finalize().unwrap();
        // A later discard of a committed object only removes the file.
        fs::remove_file(dest.path_for(&id)).unwrap();
        dest.discard(&id).unwrap();

        assert!(dir.path().join("b").is_dir());
    }

    #[test]
    fn test_discard_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let dest = FsDestination::new(dir.path());
        let id = identity("b", "o");

        drop(dest.create_exclusive(&id, 0).unwrap());
        assert!(dest.path_for(&id).exists());

        dest.discard(&id).unwrap();
        dest.discard(&id).unwrap();
        assert!(!dest.path_for(&id).exists());
    }
}
