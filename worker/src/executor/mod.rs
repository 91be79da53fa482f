use std::{
    collections::BTreeSet,
    os::unix::{fs::PermissionsExt, process::ExitStatusExt},
    path::{Component, Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::SystemTime,
};

use path_clean::PathClean;
use rexec_castore::{
    blobservice::{get_message, BlobService},
    proto::{
        Action, ActionResult, Command, Directory, ExecutedActionMetadata, OutputDirectory,
        OutputFile, OutputSymlink,
    },
    Digest,
};
use tonic::async_trait;
use tracing::{debug, info, instrument, warn, Span};

use crate::{
    errors::parse_digest,
    image::{image_url, ImageRepository},
    materialize::{materialize, LinkStrategy},
    merkle::{upload_file, upload_output_directory, Upload},
    Error,
};

mod sandbox;

#[cfg(test)]
mod tests;

pub use sandbox::Sandbox;
pub(crate) use sandbox::remove_dir_all_forced;

/// Runs a single Action and produces its result.
///
/// Apart from internal errors, the only expected failure is
/// [Error::MissingBlobs]. A command exiting with a non-zero code is a
/// successful execution.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &Action) -> Result<ActionResult, Error>;
}

/// Executes actions as plain processes inside a fresh sandbox directory
/// per execution.
pub struct SandboxExecutor<BS> {
    blob_service: BS,

    /// Directory in which the sandboxes are created.
    sandbox_dir: PathBuf,

    link_strategy: LinkStrategy,

    /// Reported in the execution metadata.
    worker_name: String,

    // bounds the number of executions running at the same time.
    concurrent_executions: tokio::sync::Semaphore,

    image_repository: Option<Arc<ImageRepository>>,
}

impl<BS> SandboxExecutor<BS> {
    pub fn new(
        blob_service: BS,
        sandbox_dir: PathBuf,
        link_strategy: LinkStrategy,
        max_concurrent_executions: usize,
    ) -> Self {
        Self {
            blob_service,
            sandbox_dir,
            link_strategy,
            worker_name: String::new(),
            concurrent_executions: tokio::sync::Semaphore::new(max_concurrent_executions.max(1)),
            image_repository: None,
        }
    }

    pub fn with_worker_name(mut self, worker_name: impl Into<String>) -> Self {
        self.worker_name = worker_name.into();
        self
    }

    /// Fetches the container images declared by actions before running
    /// them.
    pub fn with_image_repository(mut self, image_repository: Arc<ImageRepository>) -> Self {
        self.image_repository = Some(image_repository);
        self
    }
}

#[async_trait]
impl<BS> ActionExecutor for SandboxExecutor<BS>
where
    BS: BlobService,
{
    #[instrument(skip_all, err, fields(sandbox.path, exit_code))]
    async fn execute(&self, action: &Action) -> Result<ActionResult, Error> {
        let _permit = self
            .concurrent_executions
            .acquire()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        let metadata = ExecutedActionMetadata {
            worker: self.worker_name.clone(),
            worker_start_timestamp: Some(SystemTime::now().into()),
            input_fetch_start_timestamp: Some(SystemTime::now().into()),
            ..Default::default()
        };

        let command_digest = parse_digest(action.command_digest.as_ref(), "command_digest")?;
        let input_root_digest =
            parse_digest(action.input_root_digest.as_ref(), "input_root_digest")?;

        let mut missing = BTreeSet::new();

        let command: Option<Command> = get_message(&self.blob_service, &command_digest).await?;
        if command.is_none() {
            missing.insert(command_digest);
        }

        let Some(input_root) =
            get_message::<Directory, _>(&self.blob_service, &input_root_digest).await?
        else {
            missing.insert(input_root_digest);
            return Err(Error::missing_blobs(missing));
        };

        let sandbox = Sandbox::create(&self.sandbox_dir).await?;
        Span::current().record("sandbox.path", tracing::field::debug(sandbox.path()));

        let result = self
            .execute_in(action, command, &input_root, missing, metadata, sandbox.path())
            .await;

        if let Err(e) = sandbox.remove().await {
            warn!(err=%e, "unable to remove sandbox");
        }
        result
    }
}

impl<BS> SandboxExecutor<BS>
where
    BS: BlobService,
{
    /// Materializes the inputs into `root`, runs the command there and
    /// collects its outputs.
    async fn execute_in(
        &self,
        action: &Action,
        command: Option<Command>,
        input_root: &Directory,
        mut missing: BTreeSet<Digest>,
        mut metadata: ExecutedActionMetadata,
        root: &Path,
    ) -> Result<ActionResult, Error> {
        missing.extend(materialize(&self.blob_service, input_root, root, self.link_strategy).await?);

        let command = match command {
            Some(command) if missing.is_empty() => command,
            _ => return Err(Error::missing_blobs(missing)),
        };
        if let (Some(images), Some(url)) = (&self.image_repository, image_url(action, &command)) {
            let image_dir = images.fetch_image(&url).await?;
            debug!(image.dir=?image_dir, "container image available");
        }
        metadata.input_fetch_completed_timestamp = Some(SystemTime::now().into());

        let working_directory = resolve_relative(Path::new(""), &command.working_directory)?;
        if let Some(symlink) = find_symlink(root, &working_directory).await? {
            return Err(Error::InvalidArgument(format!(
                "working directory {:?} passes through symlink {:?}",
                command.working_directory, symlink
            )));
        }
        let cwd = root.join(&working_directory);
        tokio::fs::create_dir_all(&cwd).await?;

        let outputs = declared_outputs(&command)
            .into_iter()
            .map(|output| {
                let relative = resolve_relative(&working_directory, &output)?;
                if relative.as_os_str().is_empty() {
                    return Err(Error::InvalidArgument(format!(
                        "output path {:?} refers to the working directory",
                        output
                    )));
                }
                Ok((output, relative))
            })
            .collect::<Result<Vec<_>, Error>>()?;

        for (declared, relative) in &outputs {
            let parent = relative.parent().unwrap_or(Path::new(""));
            if let Some(symlink) = find_symlink(root, parent).await? {
                return Err(Error::InvalidArgument(format!(
                    "output path {:?} passes through symlink {:?}",
                    declared, symlink
                )));
            }
            tokio::fs::create_dir_all(root.join(parent)).await?;
        }

        metadata.execution_start_timestamp = Some(SystemTime::now().into());
        let output = run_command(&command, &cwd).await?;
        metadata.execution_completed_timestamp = Some(SystemTime::now().into());

        let exit_code = match output.status.code() {
            Some(code) => code,
            None => 128 + output.status.signal().unwrap_or(0),
        };
        Span::current().record("exit_code", exit_code);

        metadata.output_upload_start_timestamp = Some(SystemTime::now().into());

        let mut result = ActionResult {
            exit_code,
            stdout_digest: Some(self.blob_service.put(output.stdout.into()).await?.into()),
            stderr_digest: Some(self.blob_service.put(output.stderr.into()).await?.into()),
            ..Default::default()
        };

        // Outputs below another declared output are collected first, as
        // copies, so the enclosing one still finds their contents.
        let nested: Vec<bool> = outputs
            .iter()
            .map(|(_, relative)| {
                outputs
                    .iter()
                    .any(|(_, other)| other != relative && relative.starts_with(other))
            })
            .collect();
        let mut collected: Vec<Option<CollectedOutput>> = vec![None; outputs.len()];
        for pass_nested in [true, false] {
            for (i, (declared, relative)) in outputs.iter().enumerate() {
                if nested[i] != pass_nested {
                    continue;
                }
                let upload = if pass_nested {
                    Upload::Copy
                } else {
                    Upload::Move
                };
                collected[i] = self.collect_output(root, declared, relative, upload).await?;
            }
        }

        for output in collected.into_iter().flatten() {
            match output {
                CollectedOutput::File(file) => result.output_files.push(file),
                CollectedOutput::Directory(directory) => result.output_directories.push(directory),
                CollectedOutput::Symlink(symlink) => result.output_symlinks.push(symlink),
            }
        }

        metadata.output_upload_completed_timestamp = Some(SystemTime::now().into());
        metadata.worker_completed_timestamp = Some(SystemTime::now().into());
        result.execution_metadata = Some(metadata);

        info!(exit_code, "action executed");

        Ok(result)
    }

    /// Uploads the output at `relative` below `root`. Returns None if the
    /// command didn't produce it.
    async fn collect_output(
        &self,
        root: &Path,
        declared: &str,
        relative: &Path,
        upload: Upload,
    ) -> Result<Option<CollectedOutput>, Error> {
        // the command might have replaced a parent with a symlink.
        if let Some(symlink) = find_symlink(root, relative.parent().unwrap_or(Path::new(""))).await?
        {
            warn!(output=%declared, symlink=?symlink, "declared output below a symlink, ignoring");
            return Ok(None);
        }

        let path = root.join(relative);
        let file_metadata = match tokio::fs::symlink_metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(output=%declared, "declared output not produced");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let output = if file_metadata.is_dir() {
            let tree_digest = upload_output_directory(&self.blob_service, &path, upload).await?;
            CollectedOutput::Directory(OutputDirectory {
                path: declared.to_string(),
                tree_digest: Some(tree_digest.into()),
                is_topologically_sorted: false,
            })
        } else if file_metadata.is_file() {
            let digest = upload_file(&self.blob_service, &path, upload).await?;
            CollectedOutput::File(OutputFile {
                path: declared.to_string(),
                digest: Some(digest.into()),
                is_executable: file_metadata.permissions().mode() & 0o111 != 0,
                ..Default::default()
            })
        } else if file_metadata.is_symlink() {
            let target = tokio::fs::read_link(&path).await?;
            CollectedOutput::Symlink(OutputSymlink {
                path: declared.to_string(),
                target: target.to_string_lossy().into_owned(),
            })
        } else {
            debug!(output=%declared, "declared output has unsupported type, ignoring");
            return Ok(None);
        };
        Ok(Some(output))
    }
}

#[derive(Clone)]
enum CollectedOutput {
    File(OutputFile),
    Directory(OutputDirectory),
    Symlink(OutputSymlink),
}

/// Returns the first path below `root` along `relative`, `relative` itself
/// included, that is a symlink. Stops at the first component that doesn't
/// exist.
async fn find_symlink(root: &Path, relative: &Path) -> Result<Option<PathBuf>, Error> {
    let mut current = root.to_path_buf();
    for component in relative.components() {
        current.push(component);
        match tokio::fs::symlink_metadata(&current).await {
            Ok(metadata) if metadata.file_type().is_symlink() => return Ok(Some(current)),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(None)
}

/// Returns the output paths in the order they are collected.
fn declared_outputs(command: &Command) -> Vec<String> {
    if !command.output_paths.is_empty() {
        return command.output_paths.clone();
    }

    let mut outputs = command.output_files.clone();
    for output in &command.output_directories {
        if !outputs.contains(output) {
            outputs.push(output.clone());
        }
    }
    outputs
}

/// Lexically resolves `path` relative to `base`, both relative to the
/// sandbox root. Fails if the result would leave the sandbox.
/// The sandbox root itself resolves to an empty path.
fn resolve_relative(base: &Path, path: &str) -> Result<PathBuf, Error> {
    if Path::new(path).is_absolute() {
        return Err(Error::InvalidArgument(format!(
            "path {:?} must be relative",
            path
        )));
    }

    let cleaned = base.join(path).clean();

    let mut resolved = PathBuf::new();
    for component in cleaned.components() {
        match component {
            Component::Normal(c) => resolved.push(c),
            Component::CurDir => {}
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "path {:?} escapes the input root",
                    path
                )))
            }
        }
    }
    Ok(resolved)
}

/// Spawns the command in `cwd` with exactly the declared environment and
/// waits for it, capturing its output.
#[instrument(skip(command), err, fields(argv=?command.arguments))]
async fn run_command(command: &Command, cwd: &Path) -> Result<std::process::Output, Error> {
    let (program, args) = command
        .arguments
        .split_first()
        .ok_or_else(|| Error::InvalidArgument("command has no arguments".into()))?;

    tokio::process::Command::new(program)
        .args(args)
        .current_dir(cwd)
        .env_clear()
        .envs(
            command
                .environment_variables
                .iter()
                .map(|env| (&env.name, &env.value)),
        )
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| Error::Spawn {
            program: program.clone(),
            source: e,
        })
}
