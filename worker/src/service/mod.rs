//! The `build.bazel.remote.execution.v2.Execution` gRPC service.
use std::{sync::Arc, time::Instant};

use futures::stream::BoxStream;
use rexec_castore::{
    actioncache::ActionCacheService,
    blobservice::{get_message, BlobService},
    proto::{
        digest_function, execution_server::Execution, execution_stage,
        google::longrunning::{operation, Operation},
        pack_any, Action, ExecuteOperationMetadata, ExecuteRequest, ExecuteResponse,
        WaitExecutionRequest, EXECUTE_OPERATION_METADATA_NAME, EXECUTE_RESPONSE_NAME,
    },
    Coalescer, Digest,
};
use tonic::{async_trait, Request, Response, Status};
use tracing::{debug, info, instrument, warn, Span};
use uuid::Uuid;

use crate::{errors::parse_digest, executor::ActionExecutor, Error};

#[cfg(test)]
mod tests;

/// Serves Execute requests by running actions with an [ActionExecutor].
///
/// Concurrent requests for the same cacheable action share one execution.
/// If an [ActionCacheService] is configured, results of successful
/// executions are stored in it and served from it.
pub struct ExecutionService {
    blob_service: Arc<dyn BlobService>,
    action_cache: Option<Arc<dyn ActionCacheService>>,
    executor: Arc<dyn ActionExecutor>,

    /// In-flight cacheable executions, keyed by action digest.
    executions: Coalescer<String, Result<ExecuteResponse, Status>>,
}

impl ExecutionService {
    pub fn new(
        blob_service: Arc<dyn BlobService>,
        action_cache: Option<Arc<dyn ActionCacheService>>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        Self {
            blob_service,
            action_cache,
            executor,
            executions: Coalescer::new(),
        }
    }

    /// Resolves the action of the request and runs it, returning the
    /// finished operation.
    async fn handle(&self, request: ExecuteRequest) -> Result<Operation, Error> {
        if request.digest_function != digest_function::Value::Unknown as i32
            && request.digest_function != digest_function::Value::Sha256 as i32
        {
            return Err(Error::InvalidArgument(format!(
                "unsupported digest function {}, only SHA256 is supported",
                request.digest_function
            )));
        }

        let action_digest = parse_digest(request.action_digest.as_ref(), "action_digest")?;
        Span::current().record("action_digest", tracing::field::display(&action_digest));

        let action: Action = get_message(&*self.blob_service, &action_digest)
            .await?
            .ok_or_else(|| Error::missing_blobs([action_digest.clone()]))?;

        let response = if action.do_not_cache {
            debug!("action must not be cached, executing");
            ExecuteResponse {
                result: Some(self.executor.execute(&action).await?),
                cached_result: false,
                ..Default::default()
            }
        } else {
            let action_cache = self.action_cache.clone();
            let executor = self.executor.clone();
            let digest = action_digest.clone();
            let skip_cache_lookup = request.skip_cache_lookup;

            self.executions
                .run(action_digest.to_string(), move || {
                    run_cacheable(action_cache, executor, digest, action, skip_cache_lookup)
                })
                .await
                .map_err(|e| Error::Internal(e.to_string()))??
        };

        Ok(completed_operation(&action_digest, &response))
    }
}

/// The unit of work shared by all concurrent requests for one cacheable
/// action: look up the result cache, otherwise execute and store the result
/// if the command succeeded.
async fn run_cacheable(
    action_cache: Option<Arc<dyn ActionCacheService>>,
    executor: Arc<dyn ActionExecutor>,
    action_digest: Digest,
    action: Action,
    skip_cache_lookup: bool,
) -> Result<ExecuteResponse, Status> {
    if let Some(action_cache) = action_cache.as_ref().filter(|_| !skip_cache_lookup) {
        let cached = action_cache
            .get(&action_digest)
            .await
            .map_err(|e| Status::from(Error::Storage(e)))?;

        if let Some(result) = cached {
            debug!(action_digest=%action_digest, "serving cached result");
            return Ok(ExecuteResponse {
                result: Some(result),
                cached_result: true,
                ..Default::default()
            });
        }
    }

    let result = executor.execute(&action).await?;

    if let Some(action_cache) = &action_cache {
        if result.exit_code == 0 {
            if let Err(e) = action_cache.put(&action_digest, result.clone()).await {
                warn!(action_digest=%action_digest, err=%e, "unable to store result");
            }
        } else {
            debug!(action_digest=%action_digest, exit_code=result.exit_code, "not caching failed action");
        }
    }

    Ok(ExecuteResponse {
        result: Some(result),
        cached_result: false,
        ..Default::default()
    })
}

/// Wraps a response into a finished long-running operation.
fn completed_operation(action_digest: &Digest, response: &ExecuteResponse) -> Operation {
    let metadata = ExecuteOperationMetadata {
        stage: execution_stage::Value::Completed as i32,
        action_digest: Some(action_digest.into()),
        ..Default::default()
    };

    Operation {
        name: Uuid::new_v4().to_string(),
        metadata: Some(pack_any(EXECUTE_OPERATION_METADATA_NAME, &metadata)),
        done: true,
        result: Some(operation::Result::Response(pack_any(
            EXECUTE_RESPONSE_NAME,
            response,
        ))),
    }
}

#[async_trait]
impl Execution for ExecutionService {
    type ExecuteStream = BoxStream<'static, Result<Operation, Status>>;
    type WaitExecutionStream = BoxStream<'static, Result<Operation, Status>>;

    #[instrument(skip_all, fields(action_digest))]
    async fn execute(
        &self,
        request: Request<ExecuteRequest>,
    ) -> Result<Response<Self::ExecuteStream>, Status> {
        let start = Instant::now();
        let result = self.handle(request.into_inner()).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(operation) => {
                info!(duration_ms, "execute completed");
                Ok(Response::new(Box::pin(futures::stream::once(
                    async move { Ok(operation) },
                ))))
            }
            Err(e) => {
                warn!(duration_ms, err=%e, "execute failed");
                Err(e.into())
            }
        }
    }

    async fn wait_execution(
        &self,
        _request: Request<WaitExecutionRequest>,
    ) -> Result<Response<Self::WaitExecutionStream>, Status> {
        Err(Status::unimplemented(
            "executions complete within Execute, there is nothing to wait for",
        ))
    }
}
