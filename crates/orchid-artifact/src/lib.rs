//! Orchid Artifact
//!
//! This crate provides the durable file store used to move file payloads
//! between tasks. Tasks never share a filesystem view: every file a task
//! consumes or produces crosses the task boundary as a [`FileHandle`] into a
//! [`Store`].
//!
//! The [`Store`] trait defines the backend layer (filesystem, object store,
//! etc.) and uses async streaming for efficient handling of large files.
//! [`store_file`] and [`materialize`] translate between local paths and
//! handles.

mod fs;
mod staging;

pub use fs::FsStore;
pub use staging::{materialize, store_file};

use std::path::{Component, Path};
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};

/// A boxed stream of bytes for file data.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested file was not found.
  #[error("stored file not found: {0}")]
  NotFound(String),

  /// A local path has no file name to preserve.
  #[error("path has no file name: {0}")]
  InvalidPath(std::path::PathBuf),

  /// A key would resolve outside the store.
  #[error("invalid store key: {0:?}")]
  InvalidKey(String),

  /// A file name is not a single plain path component.
  #[error("invalid file name: {0:?}")]
  InvalidBasename(String),

  /// An I/O error occurred.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Durable reference to a stored file, keeping the original file name so it
/// can be restored under the same name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileHandle {
  pub handle: String,
  pub basename: String,
}

impl FileHandle {
  /// Check that both the handle and the file name are single plain path
  /// components, so neither can point outside the directory it is joined to.
  pub fn validate(&self) -> Result<(), Error> {
    if !is_single_component(&self.handle) {
      return Err(Error::InvalidKey(self.handle.clone()));
    }
    if !is_single_component(&self.basename) {
      return Err(Error::InvalidBasename(self.basename.clone()));
    }
    Ok(())
  }
}

fn is_single_component(name: &str) -> bool {
  let mut components = Path::new(name).components();
  matches!(
    (components.next(), components.next()),
    (Some(Component::Normal(_)), None)
  )
}

/// Durable file storage trait.
///
/// Implementations provide the actual storage backend (filesystem, S3, etc.).
#[async_trait]
pub trait Store: Send + Sync {
  /// Retrieve a file by key.
  async fn get(&self, key: &str) -> Result<ByteStream, Error>;

  /// Store a file under a key.
  async fn put(&self, key: &str, data: ByteStream) -> Result<(), Error>;

  /// Delete a file by key.
  async fn delete(&self, key: &str) -> Result<(), Error>;
}
