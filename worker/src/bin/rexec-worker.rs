use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use rexec_castore::{actioncache, blobservice, proto::execution_server::ExecutionServer};
use rexec_worker::{
    executor::SandboxExecutor, image::ImageRepository, materialize::LinkStrategy,
    service::ExecutionService,
};
use tokio_listener::{Listener, ListenerAddress, SystemOptions, UserOptions};
use tonic::transport::Server;
use tracing::{info, Level};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// A global log level to use when printing logs.
    /// It's also possible to set `RUST_LOG` according to
    /// `tracing_subscriber::filter::EnvFilter`, which will always have
    /// priority.
    #[arg(long, default_value_t=Level::INFO)]
    log_level: Level,

    #[cfg(feature = "otlp")]
    /// Whether to configure OTLP. Set --otlp=false to disable.
    #[arg(long, default_missing_value = "true", default_value = "true", num_args(0..=1), require_equals(true), action(clap::ArgAction::Set))]
    otlp: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the remote execution worker daemon.
    Daemon {
        #[arg(long, short = 'l')]
        listen_address: Option<String>,

        #[arg(long, env, default_value = "memory://")]
        blob_service_addr: String,

        /// Where results of successful actions are cached. Without it,
        /// nothing is cached.
        #[arg(long, env)]
        action_cache_addr: Option<String>,

        /// Directory in which a sandbox is created for every execution.
        #[arg(long, env)]
        sandbox_dir: Option<PathBuf>,

        /// Directory holding the unpacked container images.
        #[arg(long, env)]
        image_dir: Option<PathBuf>,

        /// Defaults to the number of available CPUs.
        #[arg(long, env)]
        max_concurrent_executions: Option<usize>,

        /// How input files are placed into sandboxes. With hardlink, files
        /// are copied if the CAS is on another filesystem.
        #[arg(long, env, value_enum, default_value_t)]
        link_strategy: LinkStrategy,

        /// Reported in the execution metadata of every result.
        #[arg(long, env = "HOSTNAME", default_value = "")]
        worker_name: String,

        /// The docker compatible tool used to fetch container images.
        #[arg(long, env, default_value = "docker")]
        container_program: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    let tracing_handle = {
        #[allow(unused_mut)]
        let mut builder = rexec_tracing::TracingBuilder::default().level(cli.log_level);
        #[cfg(feature = "otlp")]
        {
            if cli.otlp {
                builder = builder.enable_otlp("rexec.worker");
            }
        }
        builder.build()?
    };

    match cli.command {
        Commands::Daemon {
            listen_address,
            blob_service_addr,
            action_cache_addr,
            sandbox_dir,
            image_dir,
            max_concurrent_executions,
            link_strategy,
            worker_name,
            container_program,
        } => {
            // initialize stores
            let blob_service: Arc<dyn blobservice::BlobService> =
                blobservice::from_addr(&blob_service_addr).await?.into();
            let action_cache: Option<Arc<dyn actioncache::ActionCacheService>> =
                match action_cache_addr {
                    Some(addr) => Some(actioncache::from_addr(&addr).await?.into()),
                    None => None,
                };

            let sandbox_dir =
                sandbox_dir.unwrap_or_else(|| std::env::temp_dir().join("rexec-sandboxes"));
            let image_dir = image_dir.unwrap_or_else(|| std::env::temp_dir().join("rexec-images"));
            let max_concurrent_executions = max_concurrent_executions.unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            });

            let images =
                Arc::new(ImageRepository::new(image_dir.clone()).with_program(container_program));
            let executor = SandboxExecutor::new(
                blob_service.clone(),
                sandbox_dir.clone(),
                link_strategy,
                max_concurrent_executions,
            )
            .with_worker_name(worker_name)
            .with_image_repository(images);

            let service =
                ExecutionService::new(blob_service, action_cache, Arc::new(executor));

            let listen_address: ListenerAddress = listen_address
                .unwrap_or_else(|| "[::]:8980".to_string())
                .parse()?;

            let mut server =
                Server::builder().trace_fn(rexec_tracing::propagate::tonic::accept_trace);
            let router = server.add_service(ExecutionServer::new(service));

            info!(
                listen_address=%listen_address,
                sandbox_dir=?sandbox_dir,
                image_dir=?image_dir,
                max_concurrent_executions,
                "listening"
            );

            let listener = Listener::bind(
                &listen_address,
                &SystemOptions::default(),
                &UserOptions::default(),
            )
            .await?;

            router
                .serve_with_incoming_shutdown(listener, async {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("shutting down");
                })
                .await?;
        }
    }

    tracing_handle.shutdown().await?;

    Ok(())
}
