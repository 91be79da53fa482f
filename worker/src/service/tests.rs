use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use futures::StreamExt;
use prost::Message;
use rexec_castore::{
    actioncache::{ActionCacheService, MemoryActionCacheService},
    blobservice::{put_message, BlobService, MemoryBlobService},
    fixtures::{DUMMY_DIGEST, DUMMY_DIGEST_2},
    proto::{
        execution_server::Execution,
        execution_stage,
        google::{
            longrunning::{operation, Operation},
            rpc::{self, PreconditionFailure},
        },
        unpack_any, Action, ActionResult, Command, Directory, ExecuteOperationMetadata,
        ExecuteRequest, ExecuteResponse, ExecutedActionMetadata, WaitExecutionRequest,
        EXECUTE_OPERATION_METADATA_NAME, EXECUTE_RESPONSE_NAME, PRECONDITION_FAILURE_NAME,
    },
    Digest,
};
use rstest::rstest;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tonic::{async_trait, Code, Request, Status};

use super::ExecutionService;
use crate::{
    executor::{ActionExecutor, SandboxExecutor},
    materialize::LinkStrategy,
    Error,
};

/// Counts its executions and blocks each one until the gate has a permit.
/// Every execution produces a distinguishable result.
struct MockExecutor {
    executions: AtomicUsize,
    exit_code: i32,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl ActionExecutor for MockExecutor {
    async fn execute(&self, _action: &Action) -> Result<ActionResult, Error> {
        let n = self.executions.fetch_add(1, Ordering::SeqCst);
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(ActionResult {
            exit_code: self.exit_code,
            execution_metadata: Some(ExecutedActionMetadata {
                worker: format!("execution-{}", n),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

struct Fixture {
    blob_service: Arc<dyn BlobService>,
    action_cache: Arc<dyn ActionCacheService>,
    executor: Arc<MockExecutor>,
    gate: Arc<Semaphore>,
    service: Arc<ExecutionService>,
}

/// A service with a result cache. Executions block until [Fixture::open] is
/// called, unless `open` is set.
fn fixture(exit_code: i32, open: bool) -> Fixture {
    let blob_service: Arc<dyn BlobService> = Arc::new(MemoryBlobService::default());
    let action_cache: Arc<dyn ActionCacheService> = Arc::new(MemoryActionCacheService::default());
    let gate = Arc::new(Semaphore::new(if open { Semaphore::MAX_PERMITS } else { 0 }));
    let executor = Arc::new(MockExecutor {
        executions: AtomicUsize::new(0),
        exit_code,
        gate: gate.clone(),
    });

    let service = Arc::new(ExecutionService::new(
        blob_service.clone(),
        Some(action_cache.clone()),
        executor.clone(),
    ));

    Fixture {
        blob_service,
        action_cache,
        executor,
        gate,
        service,
    }
}

impl Fixture {
    async fn store_action(&self, do_not_cache: bool) -> Digest {
        let action = Action {
            command_digest: Some((&*DUMMY_DIGEST).into()),
            input_root_digest: Some((&*DUMMY_DIGEST_2).into()),
            do_not_cache,
            ..Default::default()
        };
        put_message(&*self.blob_service, &action).await.unwrap()
    }

    fn open(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS - self.gate.available_permits());
    }

    fn executions(&self) -> usize {
        self.executor.executions.load(Ordering::SeqCst)
    }
}

fn request(action_digest: &Digest, skip_cache_lookup: bool) -> ExecuteRequest {
    ExecuteRequest {
        action_digest: Some(action_digest.into()),
        skip_cache_lookup,
        ..Default::default()
    }
}

/// Calls Execute, checks there's exactly one finished operation in the
/// stream and returns it along with the response it carries.
async fn execute(
    service: &ExecutionService,
    request: ExecuteRequest,
) -> Result<(Operation, ExecuteResponse), Status> {
    let mut stream = service.execute(Request::new(request)).await?.into_inner();

    let operation = stream
        .next()
        .await
        .expect("must yield an operation")
        .expect("must not fail");
    assert!(stream.next().await.is_none(), "must yield exactly one operation");
    assert!(operation.done);

    let response = match &operation.result {
        Some(operation::Result::Response(any)) => {
            unpack_any::<ExecuteResponse>(EXECUTE_RESPONSE_NAME, any).expect("must unpack")
        }
        other => panic!("unexpected operation result {:?}", other),
    };

    Ok((operation, response))
}

#[tokio::test]
async fn operation_envelope() {
    let f = fixture(0, true);
    let digest = f.store_action(false).await;

    let (operation, response) = execute(&f.service, request(&digest, false))
        .await
        .expect("must succeed");

    assert!(uuid::Uuid::parse_str(&operation.name).is_ok());
    let metadata: ExecuteOperationMetadata = unpack_any(
        EXECUTE_OPERATION_METADATA_NAME,
        operation.metadata.as_ref().expect("must have metadata"),
    )
    .expect("must unpack");
    assert_eq!(execution_stage::Value::Completed as i32, metadata.stage);
    assert_eq!(Some((&digest).into()), metadata.action_digest);

    assert!(!response.cached_result);
    assert_eq!(0, response.result.expect("must have result").exit_code);
}

/// Concurrent requests for the same action run it once and all receive the
/// same result.
#[tokio::test]
async fn concurrent_requests_coalesced() {
    const N: usize = 5;

    let f = fixture(0, false);
    let digest = f.store_action(false).await;

    let handles: Vec<_> = (0..N)
        .map(|_| {
            let service = f.service.clone();
            let request = request(&digest, false);
            tokio::spawn(async move { execute(&service, request).await })
        })
        .collect();

    while f.service.executions.waiters(&digest.to_string()) < N {
        tokio::task::yield_now().await;
    }
    f.open();

    let mut responses = Vec::new();
    for handle in handles {
        let (_, response) = handle.await.unwrap().expect("must succeed");
        responses.push(response);
    }

    assert_eq!(1, f.executions());
    assert!(responses.iter().all(|response| *response == responses[0]));
    assert_eq!(0, f.service.executions.in_flight());

    // the result got cached, later requests are served from the cache.
    let (_, response) = execute(&f.service, request(&digest, false))
        .await
        .expect("must succeed");
    assert!(response.cached_result);
    assert_eq!(responses[0].result, response.result);
    assert_eq!(1, f.executions());
}

#[tokio::test]
async fn do_not_cache_always_executes() {
    let f = fixture(0, true);
    let digest = f.store_action(true).await;

    for _ in 0..2 {
        let (_, response) = execute(&f.service, request(&digest, false))
            .await
            .expect("must succeed");
        assert!(!response.cached_result);
    }

    assert_eq!(2, f.executions());
    assert_eq!(None, f.action_cache.get(&digest).await.unwrap());
    assert_eq!(0, f.service.executions.in_flight());
}

#[rstest]
#[case::success(0, true)]
#[case::failure(1, false)]
#[case::killed(137, false)]
#[tokio::test]
async fn only_successful_results_cached(#[case] exit_code: i32, #[case] cached: bool) {
    let f = fixture(exit_code, true);
    let digest = f.store_action(false).await;

    let (_, first) = execute(&f.service, request(&digest, false))
        .await
        .expect("must succeed");
    assert!(!first.cached_result);
    assert_eq!(cached, f.action_cache.get(&digest).await.unwrap().is_some());

    let (_, second) = execute(&f.service, request(&digest, false))
        .await
        .expect("must succeed");
    assert_eq!(cached, second.cached_result);
    assert_eq!(if cached { 1 } else { 2 }, f.executions());
}

#[tokio::test]
async fn skip_cache_lookup() {
    let f = fixture(0, true);
    let digest = f.store_action(false).await;

    f.action_cache
        .put(
            &digest,
            ActionResult {
                exit_code: 0,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let (_, response) = execute(&f.service, request(&digest, true))
        .await
        .expect("must succeed");
    assert!(!response.cached_result);
    assert_eq!(1, f.executions());

    // the fresh result replaced the cached one.
    assert_eq!(
        response.result,
        f.action_cache.get(&digest).await.unwrap()
    );
}

#[tokio::test]
async fn no_action_cache() {
    let f = fixture(0, true);
    let service = ExecutionService::new(f.blob_service.clone(), None, f.executor.clone());
    let digest = f.store_action(false).await;

    for _ in 0..2 {
        let (_, response) = execute(&service, request(&digest, false))
            .await
            .expect("must succeed");
        assert!(!response.cached_result);
    }
    assert_eq!(2, f.executions());
}

#[tokio::test]
async fn missing_action() {
    let f = fixture(0, true);
    let digest = Digest::of(b"not an action");

    let status = execute(&f.service, request(&digest, false))
        .await
        .expect_err("must fail");
    assert_eq!(Code::FailedPrecondition, status.code());

    let details = rpc::Status::decode(status.details()).expect("must decode");
    assert_eq!(1, details.details.len());
    let failure: PreconditionFailure =
        unpack_any(PRECONDITION_FAILURE_NAME, &details.details[0]).expect("must unpack");
    assert_eq!(1, failure.violations.len());
    assert_eq!("MISSING", failure.violations[0].r#type);
    assert_eq!(
        format!("blobs/{}/{}", digest.hash_hex(), digest.size()),
        failure.violations[0].subject
    );

    assert_eq!(0, f.executions());
}

#[rstest]
#[case::sha1(2, Code::InvalidArgument)]
#[case::blake3(9, Code::InvalidArgument)]
#[case::unknown(0, Code::Ok)]
#[case::sha256(1, Code::Ok)]
#[tokio::test]
async fn supported_digest_functions(#[case] digest_function: i32, #[case] exp_code: Code) {
    let f = fixture(0, true);
    let digest = f.store_action(false).await;

    let result = execute(
        &f.service,
        ExecuteRequest {
            digest_function,
            ..request(&digest, false)
        },
    )
    .await;

    match result {
        Ok(_) => assert_eq!(Code::Ok, exp_code),
        Err(status) => {
            assert_eq!(exp_code, status.code());
            assert_eq!(0, f.executions());
        }
    }
}

#[tokio::test]
async fn invalid_action_digest() {
    let f = fixture(0, true);

    let status = execute(&f.service, ExecuteRequest::default())
        .await
        .expect_err("must fail");
    assert_eq!(Code::InvalidArgument, status.code());
}

#[tokio::test]
async fn wait_execution_unimplemented() {
    let f = fixture(0, true);

    let status = f
        .service
        .wait_execution(Request::new(WaitExecutionRequest {
            name: "some-operation".into(),
        }))
        .await
        .err()
        .expect("must fail");
    assert_eq!(Code::Unimplemented, status.code());
}

/// An action writing `out.txt` run through a sandboxed executor, and one
/// never writing it.
#[rstest]
#[case::written("printf ok > out.txt", true)]
#[case::not_written("true", false)]
#[tokio::test]
async fn end_to_end(#[case] script: &str, #[case] written: bool) {
    let blob_service: Arc<dyn BlobService> = Arc::new(MemoryBlobService::default());
    let sandbox_dir = TempDir::new().unwrap();
    let executor = SandboxExecutor::new(
        blob_service.clone(),
        sandbox_dir.path().to_path_buf(),
        LinkStrategy::HardLink,
        1,
    );
    let service = ExecutionService::new(
        blob_service.clone(),
        Some(Arc::new(MemoryActionCacheService::default())),
        Arc::new(executor),
    );

    let command = Command {
        arguments: vec!["/bin/sh".into(), "-c".into(), script.into()],
        output_files: vec!["out.txt".into()],
        ..Default::default()
    };
    let action = Action {
        command_digest: Some(put_message(&*blob_service, &command).await.unwrap().into()),
        input_root_digest: Some(
            put_message(&*blob_service, &Directory::default())
                .await
                .unwrap()
                .into(),
        ),
        ..Default::default()
    };
    let action_digest = put_message(&*blob_service, &action).await.unwrap();

    let (_, response) = execute(&service, request(&action_digest, false))
        .await
        .expect("must succeed");
    let result = response.result.expect("must have result");

    assert_eq!(0, result.exit_code);
    if written {
        assert_eq!(1, result.output_files.len());
        let output = &result.output_files[0];
        assert_eq!("out.txt", output.path);
        assert_eq!(Some((&Digest::of(b"ok")).into()), output.digest);
        assert!(!output.is_executable);
    } else {
        assert!(result.output_files.is_empty());
    }

    assert_eq!(0, std::fs::read_dir(sandbox_dir.path()).unwrap().count());
}
