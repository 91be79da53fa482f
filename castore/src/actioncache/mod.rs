use tonic::async_trait;

use crate::{proto::ActionResult, Digest, Error};

mod from_addr;
mod memory;
mod simplefs;


pub use self::from_addr::from_addr;
pub use self::memory::MemoryActionCacheService;
pub use self::simplefs::SimpleFilesystemActionCacheService;

/// The base trait all ActionCache services need to implement.
///
/// It maps action digests to the [ActionResult] of a previous execution.
/// Entries are never removed through this trait; putting a result for a
/// digest that already has one replaces it.
#[async_trait]
pub trait ActionCacheService: Send + Sync {
    /// Looks up the result of a previous execution of the action.
    async fn get(&self, action_digest: &Digest) -> Result<Option<ActionResult>, Error>;

    /// Records the result of executing the action.
    async fn put(&self, action_digest: &Digest, result: ActionResult) -> Result<(), Error>;
}

#[async_trait]
impl<A> ActionCacheService for A
where
    A: AsRef<dyn ActionCacheService> + Send + Sync,
{
    async fn get(&self, action_digest: &Digest) -> Result<Option<ActionResult>, Error> {
        self.as_ref().get(action_digest).await
    }

    async fn put(&self, action_digest: &Digest, result: ActionResult) -> Result<(), Error> {
        self.as_ref().put(action_digest, result).await
    }
}
