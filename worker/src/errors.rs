use std::collections::BTreeSet;

use prost::Message;
use rexec_castore::{
    proto::{
        self,
        google::rpc::{self, precondition_failure::Violation, PreconditionFailure},
    },
    Digest, DigestError,
};
use thiserror::Error;
use tonic::{Code, Status};

use crate::image::ImageError;

/// Errors produced while handling an execution.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Blobs referenced by the action are absent from the CAS.
    /// Always sorted and free of duplicates, see [Error::missing_blobs].
    #[error("missing blobs: {}", format_digests(.0))]
    MissingBlobs(Vec<Digest>),

    #[error("storage error: {0}")]
    Storage(#[from] rexec_castore::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unable to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Status(#[from] Status),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn missing_blobs(digests: impl IntoIterator<Item = Digest>) -> Self {
        Error::MissingBlobs(digests.into_iter().collect::<BTreeSet<_>>().into_iter().collect())
    }
}

impl From<DigestError> for Error {
    fn from(value: DigestError) -> Self {
        Error::InvalidArgument(value.to_string())
    }
}

impl From<ImageError> for Error {
    fn from(value: ImageError) -> Self {
        match value {
            ImageError::InvalidReference(_) => Error::InvalidArgument(value.to_string()),
            value => Error::Internal(value.to_string()),
        }
    }
}

fn format_digests(digests: &[Digest]) -> String {
    digests
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parses a required digest field of a request message.
pub(crate) fn parse_digest(
    digest: Option<&proto::Digest>,
    field: &'static str,
) -> Result<Digest, Error> {
    let digest = digest.ok_or_else(|| Error::InvalidArgument(format!("{} is missing", field)))?;
    Digest::try_from(digest).map_err(|e| Error::InvalidArgument(format!("{}: {}", field, e)))
}

/// Builds a FAILED_PRECONDITION status carrying one `MISSING` violation per
/// digest in its `google.rpc.Status` details.
fn missing_blobs_status(digests: &[Digest]) -> Status {
    let message = format!("missing blobs: {}", format_digests(digests));

    let failure = PreconditionFailure {
        violations: digests
            .iter()
            .map(|digest| Violation {
                r#type: "MISSING".into(),
                subject: format!("blobs/{}", digest),
                description: String::new(),
            })
            .collect(),
    };

    let details = rpc::Status {
        code: Code::FailedPrecondition as i32,
        message: message.clone(),
        details: vec![proto::pack_any(proto::PRECONDITION_FAILURE_NAME, &failure)],
    };

    Status::with_details(
        Code::FailedPrecondition,
        message,
        details.encode_to_vec().into(),
    )
}

impl From<Error> for Status {
    fn from(value: Error) -> Self {
        match value {
            Error::InvalidArgument(msg) => Status::invalid_argument(msg),
            Error::MissingBlobs(digests) => missing_blobs_status(&digests),
            Error::Status(status) => status,
            e => Status::internal(e.to_string()),
        }
    }
}
