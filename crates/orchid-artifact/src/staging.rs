//! Moving files between local paths and the store.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::{Error, FileHandle, Store};

/// Upload a local file into the store under a fresh key.
pub async fn store_file(store: &dyn Store, path: &Path) -> Result<FileHandle, Error> {
  let basename = path
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .ok_or_else(|| Error::InvalidPath(path.to_path_buf()))?;

  let file = File::open(path).await?;
  let stream = ReaderStream::new(file).map(|r| r.map_err(Error::Io));

  let handle = uuid::Uuid::new_v4().to_string();
  store.put(&handle, Box::pin(stream)).await?;

  debug!(path = %path.display(), handle = %handle, "stored file");
  Ok(FileHandle { handle, basename })
}

/// Download a stored file to `dest`, creating parent directories.
///
/// Callers build `dest` from the handle's parts, so the handle is checked
/// with [`FileHandle::validate`] before anything is written.
pub async fn materialize(
  store: &dyn Store,
  file: &FileHandle,
  dest: &Path,
) -> Result<PathBuf, Error> {
  file.validate()?;
  let mut stream = store.get(&file.handle).await?;

  if let Some(parent) = dest.parent() {
    fs::create_dir_all(parent).await?;
  }

  let mut out = File::create(dest).await?;
  while let Some(chunk) = stream.next().await {
    out.write_all(&chunk?).await?;
  }
  out.flush().await?;

  debug!(handle = %file.handle, dest = %dest.display(), "materialized file");
  Ok(dest.to_path_buf())
}
