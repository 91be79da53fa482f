mod coalesce;
mod digests;
mod errors;

pub mod actioncache;
pub mod blobservice;
pub mod fixtures;
pub mod proto;

pub use coalesce::{Coalescer, TaskFailed};
pub use digests::{Digest, Error as DigestError, SHA256_LEN};
pub use errors::Error;

// templates expanded by `#[apply]` refer to the crate from the root.
#[cfg(test)]
#[allow(clippy::single_component_path_imports)]
use rstest_reuse;
