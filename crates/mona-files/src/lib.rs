#![deny(clippy::all)]

//! On-disk content-addressed file store.
//!
//! Content lives at `root/HH/REST`, where `HH` is the first two characters
//! of the content hash; stored files are made non-writable. An in-memory
//! cache keeps this session's bytes around, and write-back is either eager
//! or deferred to session exit.

use std::{fs, sync::Arc};

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use mona::{make_nonwritable, Error, FileStore, Session, SessionPlugin};
use mona_hash::Hash;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

/// Session plugin exposing the store as the session's file manager.
#[derive(Clone)]
pub struct FileManager {
    inner: Arc<Inner>,
}

struct Inner {
    root: Utf8PathBuf,
    eager: bool,
    cache: Mutex<FxHashMap<Hash, Bytes>>,
    path_cache: Mutex<FxHashMap<Utf8PathBuf, Hash>>,
}

impl FileManager {
    pub fn new(root: impl Into<Utf8PathBuf>, eager: bool) -> Arc<FileManager> {
        Arc::new(FileManager {
            inner: Arc::new(Inner {
                root: root.into(),
                eager,
                cache: Mutex::new(FxHashMap::default()),
                path_cache: Mutex::new(FxHashMap::default()),
            }),
        })
    }

    fn path_of(&self, hash: &Hash) -> Utf8PathBuf {
        let hex = hash.as_str();
        self.inner.root.join(&hex[..2]).join(&hex[2..])
    }

    fn existing_path(&self, hash: &Hash) -> Result<Utf8PathBuf, Error> {
        let path = self.path_of(hash);
        if !path.is_file() {
            return Err(Error::MissingFile(hash.clone()));
        }
        Ok(path)
    }

    fn primed_path(&self, hash: &Hash) -> Result<Utf8PathBuf, Error> {
        let path = self.path_of(hash);
        fs::create_dir_all(path.parent().expect("store paths have parents"))?;
        Ok(path)
    }

    fn write_bytes(&self, hash: &Hash, content: &[u8]) -> Result<(), Error> {
        let stored = self.primed_path(hash)?;
        if stored.exists() {
            return Ok(());
        }
        fs::write(&stored, content)?;
        make_nonwritable(&stored)?;
        Ok(())
    }

    fn adopt_path(&self, hash: &Hash, path: &Utf8Path, precious: bool) -> Result<(), Error> {
        let stored = self.primed_path(hash)?;
        if stored.exists() {
            return Ok(());
        }
        if precious {
            fs::copy(path, &stored)?;
        } else if fs::rename(path, &stored).is_err() {
            // Rename fails across filesystems (scratch dirs under /tmp);
            // fall back to a copy.
            fs::copy(path, &stored)?;
            let _ = fs::remove_file(path);
        }
        make_nonwritable(&stored)?;
        Ok(())
    }

    /// Flush the in-memory cache to disk (deferred write-back mode).
    pub fn store_cache(&self) -> Result<(), Error> {
        let cache = self.inner.cache.lock();
        debug!("flushing {} cached blobs", cache.len());
        for (hash, content) in cache.iter() {
            self.write_bytes(hash, content)?;
        }
        Ok(())
    }
}

impl FileStore for FileManager {
    fn store_bytes(&self, content: Bytes) -> Result<Hash, Error> {
        let hash = Hash::of_bytes(&content);
        if !self.contains(&hash) {
            if self.inner.eager {
                self.write_bytes(&hash, &content)?;
            }
            self.inner.cache.lock().insert(hash.clone(), content);
        }
        Ok(hash)
    }

    fn store_path(&self, path: &Utf8Path, precious: bool) -> Result<Hash, Error> {
        if let Some(hash) = self.inner.path_cache.lock().get(path) {
            return Ok(hash.clone());
        }
        let file = fs::File::open(path)?;
        let hash = Hash::of_reader(file)?;
        if !self.contains(&hash) {
            if self.inner.eager {
                self.adopt_path(&hash, path, precious)?;
            } else {
                // The original may be renamed away later, so the content
                // has to survive in memory until write-back.
                let content = Bytes::from(fs::read(path)?);
                self.inner.cache.lock().insert(hash.clone(), content);
            }
        }
        self.inner
            .path_cache
            .lock()
            .insert(path.to_owned(), hash.clone());
        Ok(hash)
    }

    fn get_bytes(&self, hash: &Hash) -> Result<Bytes, Error> {
        if let Some(content) = self.inner.cache.lock().get(hash) {
            return Ok(content.clone());
        }
        let path = self.existing_path(hash)?;
        let content = Bytes::from(fs::read(path)?);
        self.inner
            .cache
            .lock()
            .insert(hash.clone(), content.clone());
        Ok(content)
    }

    fn target_in(&self, target: &Utf8Path, hash: &Hash, mutable: bool) -> Result<(), Error> {
        match self.existing_path(hash) {
            Ok(stored) => {
                if mutable {
                    fs::copy(stored, target)?;
                } else {
                    symlink(&stored, target)?;
                }
                Ok(())
            }
            Err(missing) => {
                // Not on disk yet (deferred write-back); fall back to the
                // in-memory copy.
                let content = self
                    .inner
                    .cache
                    .lock()
                    .get(hash)
                    .cloned()
                    .ok_or(missing)?;
                fs::write(target, &content)?;
                if !mutable {
                    make_nonwritable(target)?;
                }
                Ok(())
            }
        }
    }

    fn contains(&self, hash: &Hash) -> bool {
        self.inner.cache.lock().contains_key(hash) || self.path_of(hash).is_file()
    }
}

impl SessionPlugin for FileManager {
    fn name(&self) -> &'static str {
        "file_manager"
    }

    fn post_enter(&self, sess: &Arc<Session>) -> Result<(), Error> {
        sess.set_file_store(Arc::new(self.clone()));
        Ok(())
    }

    fn pre_exit(&self, _sess: &Arc<Session>) -> Result<(), Error> {
        if !self.inner.eager {
            self.store_cache()?;
        }
        self.inner.cache.lock().clear();
        self.inner.path_cache.lock().clear();
        Ok(())
    }
}

#[cfg(unix)]
fn symlink(stored: &Utf8Path, target: &Utf8Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(stored, target)
}

#[cfg(not(unix))]
fn symlink(stored: &Utf8Path, target: &Utf8Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(stored, target)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, Arc<FileManager>) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().join("files")).unwrap();
        let manager = FileManager::new(root, true);
        (dir, manager)
    }

    #[test]
    fn store_bytes_is_idempotent() {
        let (_dir, manager) = store();
        let first = manager.store_bytes(Bytes::from_static(b"content")).unwrap();
        let second = manager.store_bytes(Bytes::from_static(b"content")).unwrap();
        assert_eq!(first, second);
        assert!(manager.contains(&first));
        assert_eq!(&manager.get_bytes(&first).unwrap()[..], b"content");
    }

    #[test]
    #[cfg(unix)]
    fn layout_shards_by_hash_prefix() {
        let (_dir, manager) = store();
        let hash = manager.store_bytes(Bytes::from_static(b"x")).unwrap();
        let hex = hash.as_str();
        let path = manager.inner.root.join(&hex[..2]).join(&hex[2..]);
        assert!(path.is_file());
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            fs::metadata(&path).unwrap().permissions().mode()
        };
        assert_eq!(mode & 0o222, 0, "stored files are non-writable");
    }

    #[test]
    fn missing_content_is_an_error() {
        let (_dir, manager) = store();
        let absent = Hash::of_bytes(b"never stored");
        assert!(matches!(
            manager.get_bytes(&absent),
            Err(Error::MissingFile(_))
        ));
    }

    #[test]
    #[cfg(unix)]
    fn target_in_symlinks_immutable_content() {
        let (dir, manager) = store();
        let hash = manager.store_bytes(Bytes::from_static(b"data")).unwrap();
        let target = Utf8PathBuf::from_path_buf(dir.path().join("out")).unwrap();
        manager.target_in(&target, &hash, false).unwrap();
        assert!(fs::symlink_metadata(&target).unwrap().file_type().is_symlink());
        assert_eq!(fs::read(&target).unwrap(), b"data");
    }

    #[test]
    fn store_path_moves_unless_precious() {
        let (dir, manager) = store();
        let src = Utf8PathBuf::from_path_buf(dir.path().join("src.txt")).unwrap();
        fs::write(&src, b"precious").unwrap();
        manager.store_path(&src, true).unwrap();
        assert!(src.exists(), "precious files are copied");

        let gone = Utf8PathBuf::from_path_buf(dir.path().join("gone.txt")).unwrap();
        fs::write(&gone, b"movable").unwrap();
        manager.store_path(&gone, false).unwrap();
        assert!(!gone.exists(), "non-precious files are renamed into the store");
    }
}
