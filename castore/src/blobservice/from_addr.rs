use url::Url;

use crate::Error;

use super::{BlobService, MemoryBlobService, SimpleFilesystemBlobService};

/// Constructs a new instance of a [BlobService] from an URI.
///
/// The following schemes are supported by the following services:
/// - `memory://` ([MemoryBlobService])
/// - `simplefs:///absolute/path` ([SimpleFilesystemBlobService])
pub async fn from_addr(uri: &str) -> Result<Box<dyn BlobService>, Error> {
    let url =
        Url::parse(uri).map_err(|e| Error::StorageError(format!("unable to parse url: {}", e)))?;

    let blob_service: Box<dyn BlobService> = match url.scheme() {
        "memory" => {
            // memory doesn't support host or path in the URL.
            if url.has_host() || !url.path().is_empty() {
                return Err(Error::StorageError("invalid url".to_string()));
            }
            Box::<MemoryBlobService>::default()
        }
        "simplefs" => {
            // simplefs needs a path, but no host.
            if url.has_host() || url.path().is_empty() {
                return Err(Error::StorageError(
                    "simplefs needs a path and no host".to_string(),
                ));
            }
            if url.path() == "/" {
                return Err(Error::StorageError(
                    "cowardly refusing to use / as blob store".to_string(),
                ));
            }
            Box::new(SimpleFilesystemBlobService::new(url.path().into()).await?)
        }
        scheme => {
            return Err(Error::StorageError(format!("unknown scheme: {}", scheme)));
        }
    };

    Ok(blob_service)
}

#[cfg(test)]
mod tests {
    use super::from_addr;
    use rstest::rstest;
    use std::sync::LazyLock;
    use tempfile::TempDir;

    static TMPDIR_SIMPLEFS_1: LazyLock<TempDir> = LazyLock::new(|| TempDir::new().unwrap());

    #[rstest]
    /// This uses an unsupported scheme.
    #[case::unsupported_scheme("http://foo.example/test", false)]
    /// This configures memory in the correct way.
    #[case::memory_valid("memory://", true)]
    /// This configures memory, but sets a host, which is invalid.
    #[case::memory_invalid_host("memory://foo.example", false)]
    /// This configures memory, but sets a path, which is invalid.
    #[case::memory_invalid_path("memory:///foo", false)]
    /// This configures simplefs with a path.
    #[case::simplefs_valid(&format!("simplefs://{}", TMPDIR_SIMPLEFS_1.path().to_str().unwrap()), true)]
    /// This configures simplefs without a path.
    #[case::simplefs_missing_path("simplefs://", false)]
    /// This configures simplefs with a host, which is invalid.
    #[case::simplefs_invalid_host("simplefs://host.example/foo", false)]
    /// simplefs refuses the root directory.
    #[case::simplefs_root("simplefs:///", false)]
    #[tokio::test]
    async fn test_from_addr(#[case] uri_str: &str, #[case] exp_succeed: bool) {
        if exp_succeed {
            from_addr(uri_str).await.expect("should succeed");
        } else {
            assert!(from_addr(uri_str).await.is_err(), "should fail");
        }
    }
}
