use std::path::Path;

use bytes::Bytes;
use prost::Message;
use tonic::async_trait;

use crate::{Digest, Error};

mod from_addr;
mod memory;
mod simplefs;


pub use self::from_addr::from_addr;
pub use self::memory::MemoryBlobService;
pub use self::simplefs::{SimpleFilesystemBlobService, STORED_BLOB_MODE};
pub(crate) use self::simplefs::new_tempfile_in;

/// The base trait all BlobService services need to implement.
///
/// It is the content-addressable store the worker reads its inputs from and
/// publishes its outputs to. Writes are additive: putting the same content
/// twice is a no-op, nothing is ever deleted or changed through this trait.
///
/// Lookups of absent blobs are not errors, they return `Ok(None)` (or
/// `Ok(false)`), so callers can collect all missing digests in one pass.
#[async_trait]
pub trait BlobService: Send + Sync {
    /// Check if the service has the blob, by its digest.
    async fn has(&self, digest: &Digest) -> Result<bool, Error>;

    /// Request a blob from the store, by its digest.
    async fn get(&self, digest: &Digest) -> Result<Option<Bytes>, Error>;

    /// Insert a blob into the store, returning its digest.
    async fn put(&self, data: Bytes) -> Result<Digest, Error>;

    /// Take ownership of the file at `path` as the contents of `digest`.
    /// The file may be moved away; callers must not use `path` afterwards.
    ///
    /// The caller is trusted to have hashed the file, only its size is
    /// checked against the digest.
    async fn adopt(&self, digest: &Digest, path: &Path) -> Result<(), Error>;

    /// Places the contents of `digest` at `dest`, which must not exist yet.
    /// Returns `Ok(false)` if the blob is not present.
    ///
    /// Implementations able to share storage with the filesystem hard-link
    /// their copy. The default implementation writes a fresh file.
    async fn link_to(&self, digest: &Digest, dest: &Path) -> Result<bool, Error> {
        match self.get(digest).await? {
            None => Ok(false),
            Some(data) => {
                tokio::fs::write(dest, &data).await?;
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl<A> BlobService for A
where
    A: AsRef<dyn BlobService> + Send + Sync,
{
    async fn has(&self, digest: &Digest) -> Result<bool, Error> {
        self.as_ref().has(digest).await
    }

    async fn get(&self, digest: &Digest) -> Result<Option<Bytes>, Error> {
        self.as_ref().get(digest).await
    }

    async fn put(&self, data: Bytes) -> Result<Digest, Error> {
        self.as_ref().put(data).await
    }

    async fn adopt(&self, digest: &Digest, path: &Path) -> Result<(), Error> {
        self.as_ref().adopt(digest, path).await
    }

    async fn link_to(&self, digest: &Digest, dest: &Path) -> Result<bool, Error> {
        self.as_ref().link_to(digest, dest).await
    }
}

/// Fetches a blob and decodes it as a protobuf message.
/// Returns `Ok(None)` if the blob is not present, and an error if it can't
/// be decoded.
pub async fn get_message<M, BS>(blob_service: &BS, digest: &Digest) -> Result<Option<M>, Error>
where
    M: Message + Default,
    BS: BlobService + ?Sized,
{
    match blob_service.get(digest).await? {
        None => Ok(None),
        Some(data) => Ok(Some(M::decode(data).map_err(|e| {
            Error::InvalidRequest(format!("blob {} is not a valid message: {}", digest, e))
        })?)),
    }
}

/// Encodes a protobuf message and inserts it into the store.
pub async fn put_message<M, BS>(blob_service: &BS, message: &M) -> Result<Digest, Error>
where
    M: Message,
    BS: BlobService + ?Sized,
{
    blob_service.put(message.encode_to_vec().into()).await
}

/// Checks the size of a file about to be adopted.
async fn check_adopt_size(digest: &Digest, path: &Path) -> Result<(), Error> {
    let size = tokio::fs::metadata(path).await?.len();
    if size != digest.size() {
        return Err(Error::InvalidRequest(format!(
            "file {} has size {}, but digest {} was given",
            path.display(),
            size,
            digest
        )));
    }
    Ok(())
}
