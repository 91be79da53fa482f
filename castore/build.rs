use tonic_build::manual::{Builder, Method, Service};

// The message types live in src/proto as prost derives, so only the service
// glue is generated here. This keeps the build free of a protoc dependency.
fn main() {
    let execution = Service::builder()
        .name("Execution")
        .package("build.bazel.remote.execution.v2")
        .method(
            Method::builder()
                .name("execute")
                .route_name("Execute")
                .input_type("crate::proto::ExecuteRequest")
                .output_type("crate::proto::google::longrunning::Operation")
                .codec_path("tonic::codec::ProstCodec")
                .server_streaming()
                .build(),
        )
        .method(
            Method::builder()
                .name("wait_execution")
                .route_name("WaitExecution")
                .input_type("crate::proto::WaitExecutionRequest")
                .output_type("crate::proto::google::longrunning::Operation")
                .codec_path("tonic::codec::ProstCodec")
                .server_streaming()
                .build(),
        )
        .build();

    Builder::new()
        .build_server(true)
        .build_client(true)
        .compile(&[execution]);
}
