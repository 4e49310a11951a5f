//! File entities.
//!
//! A [`File`] is the logical pair (relative path, content hash). The bytes
//! themselves live either inline (no store active) or in the session's
//! [`FileStore`], so that file content participates in task identity without
//! being copied through every spec.

use std::sync::Arc;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use mona_hash::Hash;
use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    hashing::{HashedBytes, Obj, Resolver},
    json,
    session::Session,
    util::make_nonwritable,
};

/// Content-addressed byte store, keyed by SHA-1 of the content.
pub trait FileStore: Send + Sync {
    /// Store raw bytes; idempotent.
    fn store_bytes(&self, content: Bytes) -> Result<Hash, Error>;

    /// Store a file by streamed read. `precious` copies the original into
    /// the store; otherwise it is renamed away to free up space.
    fn store_path(&self, path: &Utf8Path, precious: bool) -> Result<Hash, Error>;

    /// Fetch stored content.
    fn get_bytes(&self, hash: &Hash) -> Result<Bytes, Error>;

    /// Materialize stored content at `target`: a symlink for immutable use,
    /// a writable copy otherwise.
    fn target_in(&self, target: &Utf8Path, hash: &Hash, mutable: bool) -> Result<(), Error>;

    fn contains(&self, hash: &Hash) -> bool;
}

/// The file store of the active session, if any.
pub fn active_store() -> Option<Arc<dyn FileStore>> {
    Session::active_opt().and_then(|sess| sess.file_store())
}

/// A logical file: a relative path plus the hash of its content.
///
/// Immutable once constructed. Content is retained inline only when no file
/// store was active at construction time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct File {
    path: Utf8PathBuf,
    content_hash: Hash,
    content: Option<Bytes>,
}

impl PartialEq for File {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.content_hash == other.content_hash
    }
}

impl File {
    /// Create a file from inline bytes, registering the content with the
    /// active file store when one is present.
    pub fn from_bytes(path: impl Into<Utf8PathBuf>, content: impl Into<Bytes>) -> Result<File, Error> {
        let path = relative(path.into())?;
        let content = content.into();
        match active_store() {
            Some(store) => {
                let content_hash = store.store_bytes(content)?;
                Ok(File {
                    path,
                    content_hash,
                    content: None,
                })
            }
            None => Ok(File {
                content_hash: Hash::of_bytes(&content),
                path,
                content: Some(content),
            }),
        }
    }

    pub fn from_str(path: impl Into<Utf8PathBuf>, content: &str) -> Result<File, Error> {
        File::from_bytes(path, content.to_string().into_bytes())
    }

    /// Create a file from a path on disk, hashing by streamed read.
    ///
    /// The file keeps the path relative to `root` (or the path as given).
    /// With `precious` the original is copied into the store, otherwise it
    /// is renamed away.
    pub fn from_path(
        path: impl AsRef<Utf8Path>,
        root: Option<&Utf8Path>,
        precious: bool,
    ) -> Result<File, Error> {
        let path = path.as_ref();
        let rel = match root {
            Some(root) => path
                .strip_prefix(root)
                .map_err(|_| Error::InvalidInput(format!("{path} is not under {root}")))?
                .to_owned(),
            None => relative(path.to_owned())?,
        };
        match active_store() {
            Some(store) => Ok(File {
                path: rel,
                content_hash: store.store_path(path, precious)?,
                content: None,
            }),
            None => {
                let content = Bytes::from(std::fs::read(path)?);
                Ok(File {
                    path: rel,
                    content_hash: Hash::of_bytes(&content),
                    content: Some(content),
                })
            }
        }
    }

    pub(crate) fn from_parts(path: Utf8PathBuf, content_hash: Hash, content: Option<Bytes>) -> File {
        File {
            path,
            content_hash,
            content,
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        self.path.file_name().unwrap_or(self.path.as_str())
    }

    pub fn content_hash(&self) -> &Hash {
        &self.content_hash
    }

    pub(crate) fn content(&self) -> Option<&Bytes> {
        self.content.as_ref()
    }

    pub fn read_bytes(&self) -> Result<Bytes, Error> {
        if let Some(content) = &self.content {
            return Ok(content.clone());
        }
        match active_store() {
            Some(store) => store.get_bytes(&self.content_hash),
            None => Err(Error::MissingFile(self.content_hash.clone())),
        }
    }

    pub fn read_text(&self) -> Result<String, Error> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::InvalidInput(format!("file {} is not utf-8", self.path)))
    }

    /// Materialize the file under `dir` at its own relative path.
    pub fn target_in(&self, dir: &Utf8Path, mutable: bool) -> Result<(), Error> {
        self.materialize_at(&dir.join(&self.path), mutable)
    }

    /// Materialize the file content at an explicit target path.
    pub fn materialize_at(&self, target: &Utf8Path, mutable: bool) -> Result<(), Error> {
        if let Some(content) = &self.content {
            std::fs::write(target, content)?;
            if !mutable {
                make_nonwritable(target)?;
            }
            return Ok(());
        }
        match active_store() {
            Some(store) => store.target_in(target, &self.content_hash, mutable),
            None => Err(Error::MissingFile(self.content_hash.clone())),
        }
    }
}

fn relative(path: Utf8PathBuf) -> Result<Utf8PathBuf, Error> {
    if path.is_absolute() {
        return Err(Error::InvalidInput(format!("file path must be relative: {path}")));
    }
    Ok(path)
}

/// The hashed wrapper around [`File`]; spec is canonical JSON
/// `[path, content-hash]`.
#[derive(Debug)]
pub struct HashedFile {
    path: Utf8PathBuf,
    content_hash: Hash,
    content: Option<Arc<HashedBytes>>,
    hashid: Hash,
}

impl HashedFile {
    pub(crate) fn from_file(file: &File) -> HashedFile {
        let content = file.content().map(|bytes| Arc::new(HashedBytes::new(bytes.clone())));
        HashedFile::new(file.path().to_owned(), file.content_hash().clone(), content)
    }

    fn new(path: Utf8PathBuf, content_hash: Hash, content: Option<Arc<HashedBytes>>) -> HashedFile {
        let spec = json::file_spec(&path, &content_hash);
        HashedFile {
            path,
            content_hash,
            content,
            hashid: Hash::of_bytes(spec.as_bytes()),
        }
    }

    pub(crate) fn from_spec(spec: &[u8], resolve: &mut dyn Resolver) -> Result<HashedFile, Error> {
        let (path, content_hash) = json::parse_file_spec(spec)?;
        let content = if active_store().is_some() {
            None
        } else {
            match resolve.resolve(&content_hash)? {
                Obj::Bytes(bytes) => Some(bytes),
                other => {
                    return Err(Error::Composite(format!(
                        "file content resolved to {}",
                        other.typetag()
                    )))
                }
            }
        };
        Ok(HashedFile::new(path, content_hash, content))
    }

    pub fn hashid(&self) -> &Hash {
        &self.hashid
    }

    pub fn spec(&self) -> Vec<u8> {
        json::file_spec(&self.path, &self.content_hash).into_bytes()
    }

    pub fn label(&self) -> String {
        format!("./{}", self.path)
    }

    pub fn components(&self) -> Vec<Obj> {
        match &self.content {
            Some(bytes) => vec![Obj::Bytes(bytes.clone())],
            None => Vec::new(),
        }
    }

    pub fn value(&self) -> File {
        File::from_parts(
            self.path.clone(),
            self.content_hash.clone(),
            self.content.as_ref().map(|b| b.content().clone()),
        )
    }
}
