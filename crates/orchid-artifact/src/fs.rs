use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::{ByteStream, Error, Store};

/// Suffix of a file still being written by [`FsStore::put`].
const PARTIAL_SUFFIX: &str = ".partial";

/// Store keeping one file per key under a root directory.
///
/// Keys are relative paths made of plain components. Writes go to a
/// `.partial` sibling first and are renamed into place once complete, so a
/// reader never sees a half-written file.
pub struct FsStore {
  root: PathBuf,
}

impl FsStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  fn locate(&self, key: &str) -> Result<PathBuf, Error> {
    let relative = Path::new(key);
    let plain = !key.is_empty()
      && relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !plain {
      return Err(Error::InvalidKey(key.to_string()));
    }
    Ok(self.root.join(relative))
  }
}

fn missing_as_not_found(key: &str) -> impl FnOnce(std::io::Error) -> Error {
  let key = key.to_string();
  move |e| match e.kind() {
    std::io::ErrorKind::NotFound => Error::NotFound(key),
    _ => Error::Io(e),
  }
}

#[async_trait]
impl Store for FsStore {
  async fn get(&self, key: &str) -> Result<ByteStream, Error> {
    let path = self.locate(key)?;
    let file = File::open(&path).await.map_err(missing_as_not_found(key))?;
    Ok(Box::pin(ReaderStream::new(file).map(|r| r.map_err(Error::Io))))
  }

  async fn put(&self, key: &str, data: ByteStream) -> Result<(), Error> {
    let path = self.locate(key)?;
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).await?;
    }

    let mut partial = path.clone().into_os_string();
    partial.push(PARTIAL_SUFFIX);
    let partial = PathBuf::from(partial);

    let mut file = File::create(&partial).await?;
    let mut data = data;
    while let Some(chunk) = data.next().await {
      file.write_all(&chunk?).await?;
    }
    file.sync_all().await?;
    drop(file);

    fs::rename(&partial, &path).await?;
    debug!(key, "stored");
    Ok(())
  }

  async fn delete(&self, key: &str) -> Result<(), Error> {
    let path = self.locate(key)?;
    fs::remove_file(&path)
      .await
      .map_err(missing_as_not_found(key))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use bytes::Bytes;

  fn bytes_stream(data: &'static [u8]) -> ByteStream {
    Box::pin(futures::stream::once(async move {
      Ok::<_, Error>(Bytes::from_static(data))
    }))
  }

  async fn read_all(mut stream: ByteStream) -> Vec<u8> {
    let mut data = Vec::new();
    while let Some(chunk) = stream.next().await {
      data.extend_from_slice(&chunk.unwrap());
    }
    data
  }

  #[tokio::test]
  async fn test_put_get_delete() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::new(dir.path());

    store.put("nested/key", bytes_stream(b"hello")).await.unwrap();
    assert_eq!(read_all(store.get("nested/key").await.unwrap()).await, b"hello");
    assert!(!dir.path().join("nested/key.partial").exists());

    store.delete("nested/key").await.unwrap();
    assert!(matches!(
      store.get("nested/key").await,
      Err(Error::NotFound(_))
    ));
    assert!(matches!(
      store.delete("nested/key").await,
      Err(Error::NotFound(_))
    ));
  }

  #[tokio::test]
  async fn test_keys_cannot_leave_the_root() {
    let dir = tempfile::tempdir().unwrap();
    let secret = dir.path().join("secret.txt");
    std::fs::write(&secret, b"SECRET").unwrap();
    let store = FsStore::new(dir.path().join("store"));

    let absolute = secret.to_string_lossy().into_owned();
    for key in [absolute.as_str(), "../secret.txt", "a/../../secret.txt", "./x", ""] {
      assert!(
        matches!(store.get(key).await, Err(Error::InvalidKey(_))),
        "get accepted {:?}",
        key
      );
      assert!(matches!(
        store.put(key, bytes_stream(b"x")).await,
        Err(Error::InvalidKey(_))
      ));
      assert!(matches!(store.delete(key).await, Err(Error::InvalidKey(_))));
    }
    assert_eq!(std::fs::read(&secret).unwrap(), b"SECRET");
  }
}
