use std::sync::Arc;

use rexec_castore::{
    blobservice::{get_message, put_message, BlobService, MemoryBlobService},
    fixtures::{HELLOWORLD_BLOB_CONTENTS, HELLOWORLD_BLOB_DIGEST},
    proto::{
        command::EnvironmentVariable, Action, Command, Directory, DirectoryNode, FileNode,
        SymlinkNode, Tree,
    },
    Digest,
};
use rstest::rstest;
use tempfile::TempDir;

use super::{ActionExecutor, SandboxExecutor};
use crate::{materialize::LinkStrategy, Error};

struct Fixture {
    blob_service: Arc<dyn BlobService>,
    sandbox_dir: TempDir,
    executor: SandboxExecutor<Arc<dyn BlobService>>,
}

fn fixture() -> Fixture {
    let blob_service: Arc<dyn BlobService> = Arc::new(MemoryBlobService::default());
    let sandbox_dir = TempDir::new().unwrap();
    let executor = SandboxExecutor::new(
        blob_service.clone(),
        sandbox_dir.path().to_path_buf(),
        LinkStrategy::HardLink,
        2,
    )
    .with_worker_name("test-worker");

    Fixture {
        blob_service,
        sandbox_dir,
        executor,
    }
}

impl Fixture {
    async fn store_action(&self, command: &Command, input_root: &Directory) -> Action {
        Action {
            command_digest: Some(put_message(&*self.blob_service, command).await.unwrap().into()),
            input_root_digest: Some(
                put_message(&*self.blob_service, input_root)
                    .await
                    .unwrap()
                    .into(),
            ),
            ..Default::default()
        }
    }

    fn sandboxes_left(&self) -> usize {
        std::fs::read_dir(self.sandbox_dir.path()).unwrap().count()
    }
}

fn shell(script: &str) -> Command {
    Command {
        arguments: vec!["/bin/sh".into(), "-c".into(), script.into()],
        ..Default::default()
    }
}

/// A command writing its declared output file.
#[tokio::test]
async fn output_file_written() {
    let f = fixture();
    let command = Command {
        output_files: vec!["out.txt".into()],
        ..shell("printf ok > out.txt")
    };
    let action = f.store_action(&command, &Directory::default()).await;

    let result = f.executor.execute(&action).await.expect("must succeed");

    assert_eq!(0, result.exit_code);
    assert_eq!(1, result.output_files.len());
    assert_eq!("out.txt", result.output_files[0].path);
    assert_eq!(
        Some(Digest::of(b"ok").into()),
        result.output_files[0].digest
    );
    assert!(!result.output_files[0].is_executable);
    assert!(f.blob_service.has(&Digest::of(b"ok")).await.unwrap());

    let metadata = result.execution_metadata.expect("must be set");
    assert_eq!("test-worker", metadata.worker);
    assert!(metadata.execution_completed_timestamp.is_some());

    assert_eq!(0, f.sandboxes_left());
}

/// Declared outputs that were not produced are left out without an error.
#[tokio::test]
async fn output_file_not_written() {
    let f = fixture();
    let command = Command {
        arguments: vec!["/bin/true".into()],
        output_files: vec!["out.txt".into()],
        ..Default::default()
    };
    let action = f.store_action(&command, &Directory::default()).await;

    let result = f.executor.execute(&action).await.expect("must succeed");

    assert_eq!(0, result.exit_code);
    assert!(result.output_files.is_empty());
    assert_eq!(0, f.sandboxes_left());
}

/// A non-zero exit is a result, stdout and stderr end up in the CAS.
#[tokio::test]
async fn nonzero_exit_code() {
    let f = fixture();
    let action = f
        .store_action(
            &shell("echo out; echo err >&2; exit 3"),
            &Directory::default(),
        )
        .await;

    let result = f.executor.execute(&action).await.expect("must succeed");

    assert_eq!(3, result.exit_code);
    assert!(result.stdout_raw.is_empty());
    assert_eq!(Some(Digest::of(b"out\n").into()), result.stdout_digest);
    assert_eq!(Some(Digest::of(b"err\n").into()), result.stderr_digest);
    assert!(f.blob_service.has(&Digest::of(b"err\n")).await.unwrap());
}

#[tokio::test]
async fn killed_by_signal() {
    let f = fixture();
    let action = f
        .store_action(&shell("kill -9 $$"), &Directory::default())
        .await;

    let result = f.executor.execute(&action).await.expect("must succeed");

    assert_eq!(128 + 9, result.exit_code);
}

/// The missing command, two files and a subdirectory are all reported.
#[tokio::test]
async fn missing_blobs_aggregated() {
    let f = fixture();
    let missing_command = Digest::of(b"not a command");
    let missing_file_a = Digest::of(b"a");
    let missing_file_b = Digest::of(b"b");
    let missing_directory = Digest::of(b"not a directory");

    let input_root = Directory {
        files: vec![
            FileNode {
                name: "a".into(),
                digest: Some(missing_file_a.clone().into()),
                ..Default::default()
            },
            FileNode {
                name: "b".into(),
                digest: Some(missing_file_b.clone().into()),
                ..Default::default()
            },
            FileNode {
                name: "present".into(),
                digest: Some(HELLOWORLD_BLOB_DIGEST.clone().into()),
                ..Default::default()
            },
        ],
        directories: vec![DirectoryNode {
            name: "sub".into(),
            digest: Some(missing_directory.clone().into()),
        }],
        ..Default::default()
    };
    f.blob_service
        .put(HELLOWORLD_BLOB_CONTENTS.into())
        .await
        .unwrap();

    let action = Action {
        command_digest: Some(missing_command.clone().into()),
        input_root_digest: Some(
            put_message(&*f.blob_service, &input_root)
                .await
                .unwrap()
                .into(),
        ),
        ..Default::default()
    };

    let Err(Error::MissingBlobs(digests)) = f.executor.execute(&action).await else {
        panic!("must fail with missing blobs");
    };

    let mut expected = vec![
        missing_command,
        missing_file_a,
        missing_file_b,
        missing_directory,
    ];
    expected.sort();
    assert_eq!(expected, digests);
    assert_eq!(0, f.sandboxes_left());
}

/// No process runs if an input is missing.
#[tokio::test]
async fn missing_input_prevents_spawn() {
    let f = fixture();
    let marker_dir = TempDir::new().unwrap();
    let marker = marker_dir.path().join("marker");

    let input_root = Directory {
        files: vec![FileNode {
            name: "a".into(),
            digest: Some(Digest::of(b"a").into()),
            ..Default::default()
        }],
        ..Default::default()
    };
    let action = f
        .store_action(
            &shell(&format!("touch {}", marker.to_str().unwrap())),
            &input_root,
        )
        .await;

    let err = f.executor.execute(&action).await.expect_err("must fail");

    assert!(matches!(err, Error::MissingBlobs(ref d) if d == &vec![Digest::of(b"a")]));
    assert!(!marker.exists());
}

/// A missing input root stops processing, the command is still reported.
#[tokio::test]
async fn missing_input_root() {
    let f = fixture();
    let input_root_digest = Digest::of(b"no root");
    let action = Action {
        command_digest: Some(put_message(&*f.blob_service, &shell("true")).await.unwrap().into()),
        input_root_digest: Some(input_root_digest.clone().into()),
        ..Default::default()
    };

    let Err(Error::MissingBlobs(digests)) = f.executor.execute(&action).await else {
        panic!("must fail with missing blobs");
    };
    assert_eq!(vec![input_root_digest], digests);
}

#[tokio::test]
async fn spawn_failure_cleans_up() {
    let f = fixture();
    let command = Command {
        arguments: vec!["/nonexistent/program".into()],
        ..Default::default()
    };
    let action = f.store_action(&command, &Directory::default()).await;

    let err = f.executor.execute(&action).await.expect_err("must fail");

    assert!(matches!(err, Error::Spawn { .. }));
    assert_eq!(0, f.sandboxes_left());
}

#[tokio::test]
async fn empty_arguments_rejected() {
    let f = fixture();
    let action = f
        .store_action(&Command::default(), &Directory::default())
        .await;

    let err = f.executor.execute(&action).await.expect_err("must fail");
    assert!(matches!(err, Error::InvalidArgument(_)));
}

/// Inputs are visible to the command, outputs are relative to the working
/// directory and their parents exist before the command runs.
#[tokio::test]
async fn working_directory_and_inputs() {
    let f = fixture();
    f.blob_service
        .put(HELLOWORLD_BLOB_CONTENTS.into())
        .await
        .unwrap();

    let sub = Directory {
        files: vec![FileNode {
            name: "in.txt".into(),
            digest: Some(HELLOWORLD_BLOB_DIGEST.clone().into()),
            ..Default::default()
        }],
        ..Default::default()
    };
    let input_root = Directory {
        directories: vec![DirectoryNode {
            name: "sub".into(),
            digest: Some(put_message(&*f.blob_service, &sub).await.unwrap().into()),
        }],
        ..Default::default()
    };
    let command = Command {
        working_directory: "sub".into(),
        output_paths: vec!["out/copy.txt".into()],
        ..shell("cat in.txt > out/copy.txt")
    };
    let action = f.store_action(&command, &input_root).await;

    let result = f.executor.execute(&action).await.expect("must succeed");

    assert_eq!(0, result.exit_code);
    assert_eq!(1, result.output_files.len());
    assert_eq!("out/copy.txt", result.output_files[0].path);
    assert_eq!(
        Some(HELLOWORLD_BLOB_DIGEST.clone().into()),
        result.output_files[0].digest
    );
}

#[tokio::test]
async fn environment_is_exactly_the_declared_one() {
    let f = fixture();
    let command = Command {
        environment_variables: vec![EnvironmentVariable {
            name: "FOO".into(),
            value: "bar".into(),
        }],
        output_files: vec!["env.txt".into()],
        ..shell("printf '%s:%s' \"$FOO\" \"$HOME\" > env.txt")
    };
    let action = f.store_action(&command, &Directory::default()).await;

    let result = f.executor.execute(&action).await.expect("must succeed");

    assert_eq!(
        Some(Digest::of(b"bar:").into()),
        result.output_files[0].digest
    );
}

/// Output directories are uploaded as Trees.
#[tokio::test]
async fn output_directory() {
    let f = fixture();
    let command = Command {
        output_directories: vec!["d".into()],
        ..shell("mkdir -p d/e && printf x > d/e/f")
    };
    let action = f.store_action(&command, &Directory::default()).await;

    let result = f.executor.execute(&action).await.expect("must succeed");

    assert!(result.output_files.is_empty());
    assert_eq!(1, result.output_directories.len());
    assert_eq!("d", result.output_directories[0].path);
    assert!(!result.output_directories[0].is_topologically_sorted);

    let tree_digest =
        Digest::try_from(result.output_directories[0].tree_digest.as_ref().unwrap()).unwrap();
    let tree: Tree = get_message(&*f.blob_service, &tree_digest)
        .await
        .unwrap()
        .expect("tree must be in the CAS");
    assert_eq!("e", tree.root.unwrap().directories[0].name);
    assert_eq!("f", tree.children[0].files[0].name);
}

#[rstest]
#[case::parent("..")]
#[case::nested_parent("a/../../b")]
#[case::absolute("/tmp")]
#[tokio::test]
async fn escaping_working_directory_rejected(#[case] working_directory: &str) {
    let f = fixture();
    let command = Command {
        working_directory: working_directory.into(),
        ..shell("true")
    };
    let action = f.store_action(&command, &Directory::default()).await;

    let err = f.executor.execute(&action).await.expect_err("must fail");
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(0, f.sandboxes_left());
}

#[rstest]
#[case::parent("../out")]
#[case::absolute("/etc/passwd")]
#[case::working_directory(".")]
#[tokio::test]
async fn escaping_output_rejected(#[case] output: &str) {
    let f = fixture();
    let command = Command {
        output_files: vec![output.into()],
        ..shell("true")
    };
    let action = f.store_action(&command, &Directory::default()).await;

    let err = f.executor.execute(&action).await.expect_err("must fail");
    assert!(matches!(err, Error::InvalidArgument(_)));
}

/// An input root with `escape` pointing at a directory outside of the
/// sandbox, holding a file `victim`.
fn escaping_input_root(outside: &TempDir) -> Directory {
    std::fs::write(outside.path().join("victim"), "precious").unwrap();
    Directory {
        symlinks: vec![SymlinkNode {
            name: "escape".into(),
            target: outside.path().display().to_string(),
            ..Default::default()
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn output_through_input_symlink_rejected() {
    let f = fixture();
    let outside = TempDir::new().unwrap();
    let command = Command {
        output_files: vec!["escape/victim".into()],
        ..shell("true")
    };
    let action = f
        .store_action(&command, &escaping_input_root(&outside))
        .await;

    let err = f.executor.execute(&action).await.expect_err("must fail");
    assert!(matches!(err, Error::InvalidArgument(_)), "{:?}", err);
    assert_eq!(
        "precious",
        std::fs::read_to_string(outside.path().join("victim")).unwrap()
    );
    assert_eq!(0, f.sandboxes_left());
}

#[tokio::test]
async fn working_directory_through_input_symlink_rejected() {
    let f = fixture();
    let outside = TempDir::new().unwrap();
    let command = Command {
        working_directory: "escape".into(),
        ..shell("printf x > created")
    };
    let action = f
        .store_action(&command, &escaping_input_root(&outside))
        .await;

    let err = f.executor.execute(&action).await.expect_err("must fail");
    assert!(matches!(err, Error::InvalidArgument(_)), "{:?}", err);
    assert!(!outside.path().join("created").exists());
}

/// A symlink created by the command itself isn't followed when collecting.
#[tokio::test]
async fn output_through_created_symlink_ignored() {
    let f = fixture();
    let outside = TempDir::new().unwrap();
    std::fs::write(outside.path().join("victim"), "precious").unwrap();
    let command = Command {
        output_files: vec!["escape/victim".into()],
        ..shell(&format!(
            "rmdir escape && ln -s '{}' escape",
            outside.path().display()
        ))
    };
    let action = f.store_action(&command, &Directory::default()).await;

    let result = f.executor.execute(&action).await.expect("must succeed");
    assert_eq!(0, result.exit_code);
    assert!(result.output_files.is_empty());
    assert_eq!(
        "precious",
        std::fs::read_to_string(outside.path().join("victim")).unwrap()
    );
}

/// Outputs declared below other outputs are complete, and so are the
/// enclosing ones.
#[tokio::test]
async fn nested_outputs() {
    let f = fixture();
    let command = Command {
        output_files: vec!["a/b/f".into()],
        output_directories: vec!["a".into(), "a/b".into()],
        ..shell("mkdir -p a/b && printf x > a/b/f && printf y > a/g")
    };
    let action = f.store_action(&command, &Directory::default()).await;

    let result = f.executor.execute(&action).await.expect("must succeed");

    assert_eq!(1, result.output_files.len());
    assert_eq!("a/b/f", result.output_files[0].path);
    assert_eq!(Some(Digest::of(b"x").into()), result.output_files[0].digest);

    let trees = futures::future::join_all(result.output_directories.iter().map(|output| {
        let blob_service = f.blob_service.clone();
        let digest = Digest::try_from(output.tree_digest.as_ref().unwrap()).unwrap();
        async move {
            get_message::<Tree, _>(&*blob_service, &digest)
                .await
                .unwrap()
                .expect("tree must be in the CAS")
        }
    }))
    .await;
    assert_eq!(
        vec!["a", "a/b"],
        result
            .output_directories
            .iter()
            .map(|d| d.path.as_str())
            .collect::<Vec<_>>()
    );

    let a = trees[0].root.as_ref().unwrap();
    assert_eq!("g", a.files[0].name);
    assert_eq!("b", a.directories[0].name);
    assert_eq!("f", trees[0].children[0].files[0].name);

    let b = trees[1].root.as_ref().unwrap();
    assert_eq!("f", b.files[0].name);
    assert_eq!(Some(Digest::of(b"x").into()), b.files[0].digest);
    assert_eq!(
        a.directories[0].digest,
        Some(b.digest().into()),
        "both trees must agree on a/b"
    );

    // file contents are in the CAS.
    assert!(f.blob_service.has(&Digest::of(b"y")).await.unwrap());
}

#[test]
fn resolve_relative() {
    use std::path::{Path, PathBuf};

    assert_eq!(
        PathBuf::from(""),
        super::resolve_relative(Path::new(""), "").unwrap()
    );
    assert_eq!(
        PathBuf::from("b/c"),
        super::resolve_relative(Path::new("a"), "../b/./c").unwrap()
    );
    assert!(super::resolve_relative(Path::new("a"), "../../c").is_err());
}

/// Actions declaring a floating image tag fail before anything runs.
#[tokio::test]
async fn unpinned_container_image_rejected() {
    use rexec_castore::proto::{platform::Property, Platform};

    use crate::image::ImageRepository;

    let image_dir = TempDir::new().unwrap();
    let f = fixture();
    let executor = SandboxExecutor::new(
        f.blob_service.clone(),
        f.sandbox_dir.path().to_path_buf(),
        LinkStrategy::HardLink,
        1,
    )
    .with_image_repository(Arc::new(ImageRepository::new(
        image_dir.path().to_path_buf(),
    )));

    let marker = image_dir.path().join("marker");
    let mut action = f
        .store_action(
            &shell(&format!("touch {}", marker.display())),
            &Directory::default(),
        )
        .await;
    action.platform = Some(Platform {
        properties: vec![Property {
            name: "container-image".into(),
            value: "docker://example.com/img:latest".into(),
        }],
    });

    let err = executor.execute(&action).await.expect_err("must fail");
    assert!(matches!(err, Error::InvalidArgument(_)), "{:?}", err);
    assert!(!marker.exists());
    assert_eq!(0, f.sandboxes_left());
}
