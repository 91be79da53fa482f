use std::path::PathBuf;

use prost::Message;
use tokio::io::AsyncWriteExt;
use tonic::async_trait;
use tracing::{instrument, warn};

use super::ActionCacheService;
use crate::{blobservice::new_tempfile_in, proto::ActionResult, Digest, Error};

/// An ActionCacheService keeping one file per action below an existing path.
///
/// Results are stored as encoded [ActionResult] messages at
/// `HASH[:2]/HASH-SIZE`. Writes go to a temporary file in `tmp` first and are
/// renamed into place, so readers never observe a partially written entry.
#[derive(Clone)]
pub struct SimpleFilesystemActionCacheService {
    path: PathBuf,
}

impl SimpleFilesystemActionCacheService {
    pub async fn new(path: PathBuf) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&path).await?;
        tokio::fs::create_dir_all(path.join("tmp")).await?;

        Ok(Self { path })
    }

    fn entry_path(&self, action_digest: &Digest) -> PathBuf {
        let hash = action_digest.hash_hex();
        self.path
            .join(&hash[..2])
            .join(format!("{}-{}", hash, action_digest.size()))
    }
}

#[async_trait]
impl ActionCacheService for SimpleFilesystemActionCacheService {
    #[instrument(skip_all, err, fields(action.digest=%action_digest))]
    async fn get(&self, action_digest: &Digest) -> Result<Option<ActionResult>, Error> {
        let data = match tokio::fs::read(self.entry_path(action_digest)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match ActionResult::decode(data.as_slice()) {
            Ok(result) => Ok(Some(result)),
            Err(e) => {
                // A corrupt entry behaves like a miss, the next put replaces it.
                warn!(err=%e, "unable to decode cached action result");
                Ok(None)
            }
        }
    }

    #[instrument(skip_all, err, fields(action.digest=%action_digest, exit_code=result.exit_code))]
    async fn put(&self, action_digest: &Digest, result: ActionResult) -> Result<(), Error> {
        let dst_path = self.entry_path(action_digest);
        if let Some(parent) = dst_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = new_tempfile_in(self.path.join("tmp")).await?;
        file.write_all(&result.encode_to_vec()).await?;
        file.flush().await?;
        file.sync_all().await?;

        tokio::fs::rename(file.file_path(), dst_path).await?;

        Ok(())
    }
}
