use tokio::sync::{mpsc, oneshot};
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(feature = "otlp")]
use opentelemetry::{trace::Tracer, KeyValue};
#[cfg(feature = "otlp")]
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    resource::{ResourceDetector, SdkProvidedResourceDetector},
    trace::BatchConfigBuilder,
    Resource,
};

pub mod propagate;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Init(#[from] tracing_subscriber::util::TryInitError),

    #[error("invalid RUST_LOG: {0}")]
    Filter(#[from] tracing_subscriber::filter::FromEnvError),

    #[error(transparent)]
    MpscSend(#[from] mpsc::error::SendError<Option<oneshot::Sender<()>>>),

    #[error(transparent)]
    OneshotRecv(#[from] oneshot::error::RecvError),

    #[cfg(feature = "otlp")]
    #[error("unable to set up otlp exporter: {0}")]
    Otlp(#[from] opentelemetry::trace::TraceError),
}

/// Returned by [TracingBuilder::build], used to flush attached exporters
/// before the process exits.
#[derive(Clone)]
pub struct TracingHandle {
    tx: Option<mpsc::Sender<Option<oneshot::Sender<()>>>>,
}

impl TracingHandle {
    /// Flushes attached exporters (otlp, if enabled). A noop otherwise.
    ///
    /// This doesn't wait for the flush to complete, pass a [oneshot::Sender]
    /// to be notified once it did.
    pub async fn flush(&self, msg: Option<oneshot::Sender<()>>) -> Result<(), Error> {
        if let Some(tx) = &self.tx {
            Ok(tx.send(msg).await?)
        } else {
            if let Some(tx) = msg {
                let _ = tx.send(());
            }
            Ok(())
        }
    }

    /// Flushes attached exporters and waits for the flush to complete.
    /// To be called on a regular shutdown.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.flush(Some(tx)).await?;
        rx.await?;
        Ok(())
    }

    /// Like [TracingHandle::shutdown], but also tears down the global tracer
    /// provider. To be called when the process got interrupted.
    pub async fn force_shutdown(&self) -> Result<(), Error> {
        self.shutdown().await?;

        #[cfg(feature = "otlp")]
        {
            // shutdown_tracer_provider can block forever if called from within the runtime.
            // https://github.com/open-telemetry/opentelemetry-rust/issues/1395#issuecomment-1953280335
            let _ = tokio::task::spawn_blocking(move || {
                opentelemetry::global::shutdown_tracer_provider();
            })
            .await;
        }

        Ok(())
    }
}

pub struct TracingBuilder {
    level: Level,

    #[cfg(feature = "otlp")]
    service_name: Option<&'static str>,
}

impl Default for TracingBuilder {
    fn default() -> Self {
        TracingBuilder {
            level: Level::INFO,

            #[cfg(feature = "otlp")]
            service_name: None,
        }
    }
}

impl TracingBuilder {
    /// Set the log level for all layers: stderr and otlp if configured.
    /// RUST_LOG still has a higher priority over this value.
    pub fn level(mut self, level: Level) -> TracingBuilder {
        self.level = level;
        self
    }

    #[cfg(feature = "otlp")]
    /// Enable otlp by setting a custom service_name
    pub fn enable_otlp(mut self, service_name: &'static str) -> TracingBuilder {
        self.service_name = Some(service_name);
        self
    }

    fn env_filter(&self) -> Result<EnvFilter, Error> {
        Ok(EnvFilter::builder()
            .with_default_directive(self.level.into())
            .from_env()?)
    }

    /// Installs the global subscriber: an [EnvFilter] built from the
    /// configured level (RUST_LOG takes precedence), and a compact fmt layer
    /// writing to stderr. The filter applies to all layers, otlp included.
    ///
    /// With the otlp feature and a service name set, spans are also exported
    /// and the returned handle can be used to flush them.
    pub fn build(self) -> Result<TracingHandle, Error> {
        let subscriber = tracing_subscriber::registry().with(self.env_filter()?).with(
            tracing_subscriber::fmt::Layer::new()
                .with_writer(std::io::stderr)
                .compact(),
        );

        #[cfg(feature = "otlp")]
        {
            if let Some(service_name) = self.service_name {
                opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

                let (tracer, tx) = gen_otlp_tracer(service_name.to_string())?;
                let layer = tracing_opentelemetry::layer().with_tracer(tracer);

                subscriber.with(Some(layer)).try_init()?;
                return Ok(TracingHandle { tx: Some(tx) });
            }
        }

        subscriber.try_init()?;

        Ok(TracingHandle { tx: None })
    }
}

/// Returns an OTLP tracer, and the TX part of a channel, which can be used
/// to request flushes (and signal back the completion of the flush).
#[cfg(feature = "otlp")]
fn gen_otlp_tracer(
    service_name: String,
) -> Result<
    (
        impl Tracer + tracing_opentelemetry::PreSampledTracer,
        mpsc::Sender<Option<oneshot::Sender<()>>>,
    ),
    Error,
> {
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .with_batch_config(
            BatchConfigBuilder::default()
                // only export on schedule, not whenever a batch fills up.
                .with_max_export_batch_size(4096)
                .with_max_queue_size(4096 * 4)
                .with_scheduled_delay(std::time::Duration::from_secs(10))
                .build(),
        )
        .with_trace_config(opentelemetry_sdk::trace::config().with_resource({
            // replace the detected default service name with ours.
            // https://github.com/open-telemetry/opentelemetry-rust/issues/1298
            let resources = SdkProvidedResourceDetector.detect(std::time::Duration::from_secs(0));
            if resources.get("service.name".into()) == Some("unknown_service".into()) {
                resources.merge(&Resource::new([KeyValue::new(
                    "service.name",
                    service_name,
                )]))
            } else {
                resources
            }
        }))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    let tracer_provider = tracer.provider().ok_or_else(|| {
        opentelemetry::trace::TraceError::Other("tracer has no provider".into())
    })?;

    let (tx, mut rx) = mpsc::channel::<Option<oneshot::Sender<()>>>(16);

    tokio::spawn(async move {
        while let Some(m) = rx.recv().await {
            // force_flush can block forever when called from within the runtime.
            let _ = tokio::task::spawn_blocking({
                let tracer_provider = tracer_provider.clone();
                move || tracer_provider.force_flush()
            })
            .await;
            if let Some(tx) = m {
                let _ = tx.send(());
            }
        }
    });

    Ok((tracer, tx))
}
