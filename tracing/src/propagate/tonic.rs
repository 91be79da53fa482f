#[cfg(feature = "otlp")]
use opentelemetry::global;
#[cfg(feature = "otlp")]
use opentelemetry_http::HeaderExtractor;
#[cfg(feature = "otlp")]
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Creates the span of an incoming gRPC request, to be passed to
/// `tonic::transport::Server::trace_fn`.
///
/// With the otlp feature, the span is attached to the trace carried in the
/// request headers, if any and valid.
pub fn accept_trace(request: &http::Request<()>) -> tracing::Span {
    let span = tracing::info_span!("grpc_request", uri = %request.uri().path());

    #[cfg(feature = "otlp")]
    {
        let parent_context = global::get_text_map_propagator(|propagator| {
            propagator.extract(&HeaderExtractor(request.headers()))
        });
        span.set_parent(parent_context);
    }

    span
}
