//! Filesystem blob store for tarballs.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncWriteExt},
};
use uuid::Uuid;

use crate::application::repos::{BlobError, BlobStore, ByteStream};

const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Flat directory of tarballs, one file per blob name.
#[derive(Debug)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Initialise storage rooted at the provided directory, creating it if necessary.
    pub fn new(root: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Blob names are single path components: no separators, no `..`.
    fn resolve(&self, name: &str) -> Result<PathBuf, BlobError> {
        let invalid = || BlobError::InvalidName(name.to_string());
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(invalid());
        }
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(name)),
            _ => Err(invalid()),
        }
    }
}

fn not_found_or_io(name: &str, err: std::io::Error) -> BlobError {
    if err.kind() == std::io::ErrorKind::NotFound {
        BlobError::NotFound(name.to_string())
    } else {
        BlobError::Io(err)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn write(&self, name: &str, data: Bytes) -> Result<(), BlobError> {
        let path = self.resolve(name)?;
        let temp_path = self.root.join(format!(".{name}.tmp.{}", Uuid::new_v4()));

        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &path).await
        }
        .await;

        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(BlobError::Io(err));
        }
        Ok(())
    }

    async fn read_stream(&self, name: &str) -> Result<ByteStream, BlobError> {
        let path = self.resolve(name)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|err| not_found_or_io(name, err))?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await.map_err(BlobError::from)?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    async fn exists(&self, name: &str) -> Result<bool, BlobError> {
        let path = self.resolve(name)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn remove(&self, name: &str) -> Result<(), BlobError> {
        let path = self.resolve(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BlobError::Io(err)),
        }
    }
}
