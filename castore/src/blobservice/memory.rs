use bytes::Bytes;
use parking_lot::RwLock;
use std::path::Path;
use std::{collections::HashMap, sync::Arc};
use tonic::async_trait;
use tracing::instrument;

use super::{check_adopt_size, BlobService};
use crate::{Digest, Error};

#[derive(Clone, Default)]
pub struct MemoryBlobService {
    db: Arc<RwLock<HashMap<Digest, Bytes>>>,
}

impl MemoryBlobService {
    fn insert(&self, digest: Digest, data: Bytes) {
        // Only insert if the blob doesn't already exist.
        let mut db = self.db.write();
        db.entry(digest).or_insert(data);
    }
}

#[async_trait]
impl BlobService for MemoryBlobService {
    #[instrument(skip_all, fields(blob.digest=%digest))]
    async fn has(&self, digest: &Digest) -> Result<bool, Error> {
        Ok(self.db.read().contains_key(digest))
    }

    #[instrument(skip_all, fields(blob.digest=%digest))]
    async fn get(&self, digest: &Digest) -> Result<Option<Bytes>, Error> {
        Ok(self.db.read().get(digest).cloned())
    }

    #[instrument(skip_all, fields(blob.size=data.len()))]
    async fn put(&self, data: Bytes) -> Result<Digest, Error> {
        let digest = Digest::of(&data);
        self.insert(digest.clone(), data);
        Ok(digest)
    }

    #[instrument(skip_all, err, fields(blob.digest=%digest, path=?path))]
    async fn adopt(&self, digest: &Digest, path: &Path) -> Result<(), Error> {
        check_adopt_size(digest, path).await?;

        let data = tokio::fs::read(path).await?;
        self.insert(digest.clone(), data.into());
        tokio::fs::remove_file(path).await?;

        Ok(())
    }
}
