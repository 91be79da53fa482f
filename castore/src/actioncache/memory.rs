use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tonic::async_trait;
use tracing::instrument;

use super::ActionCacheService;
use crate::{proto::ActionResult, Digest, Error};

#[derive(Clone, Default)]
pub struct MemoryActionCacheService {
    db: Arc<RwLock<HashMap<Digest, ActionResult>>>,
}

#[async_trait]
impl ActionCacheService for MemoryActionCacheService {
    #[instrument(skip_all, fields(action.digest=%action_digest))]
    async fn get(&self, action_digest: &Digest) -> Result<Option<ActionResult>, Error> {
        Ok(self.db.read().get(action_digest).cloned())
    }

    #[instrument(skip_all, fields(action.digest=%action_digest, exit_code=result.exit_code))]
    async fn put(&self, action_digest: &Digest, result: ActionResult) -> Result<(), Error> {
        self.db.write().insert(action_digest.clone(), result);
        Ok(())
    }
}
