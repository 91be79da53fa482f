//! The subset of the `google.rpc` and `google.longrunning` packages used by
//! the Execution service.

pub mod rpc {
    /// `google.rpc.Status`, the structured error model carried in gRPC
    /// status details and in [super::longrunning::Operation] errors.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Status {
        #[prost(int32, tag = "1")]
        pub code: i32,
        #[prost(string, tag = "2")]
        pub message: ::prost::alloc::string::String,
        #[prost(message, repeated, tag = "3")]
        pub details: ::prost::alloc::vec::Vec<::prost_types::Any>,
    }

    /// `google.rpc.PreconditionFailure`, used to report missing blobs.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PreconditionFailure {
        #[prost(message, repeated, tag = "1")]
        pub violations: ::prost::alloc::vec::Vec<precondition_failure::Violation>,
    }

    pub mod precondition_failure {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Violation {
            #[prost(string, tag = "1")]
            pub r#type: ::prost::alloc::string::String,
            #[prost(string, tag = "2")]
            pub subject: ::prost::alloc::string::String,
            #[prost(string, tag = "3")]
            pub description: ::prost::alloc::string::String,
        }
    }
}

pub mod longrunning {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Operation {
        #[prost(string, tag = "1")]
        pub name: ::prost::alloc::string::String,
        #[prost(message, optional, tag = "2")]
        pub metadata: ::core::option::Option<::prost_types::Any>,
        #[prost(bool, tag = "3")]
        pub done: bool,
        #[prost(oneof = "operation::Result", tags = "4, 5")]
        pub result: ::core::option::Option<operation::Result>,
    }

    pub mod operation {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Result {
            #[prost(message, tag = "4")]
            Error(super::super::rpc::Status),
            #[prost(message, tag = "5")]
            Response(::prost_types::Any),
        }
    }
}
