use url::Url;

use crate::Error;

use super::{ActionCacheService, MemoryActionCacheService, SimpleFilesystemActionCacheService};

/// Constructs a new instance of an [ActionCacheService] from an URI.
///
/// The following schemes are supported by the following services:
/// - `memory://` ([MemoryActionCacheService])
/// - `simplefs:///absolute/path` ([SimpleFilesystemActionCacheService])
pub async fn from_addr(uri: &str) -> Result<Box<dyn ActionCacheService>, Error> {
    let url =
        Url::parse(uri).map_err(|e| Error::StorageError(format!("unable to parse url: {}", e)))?;

    let action_cache: Box<dyn ActionCacheService> = match url.scheme() {
        "memory" => {
            if url.has_host() || !url.path().is_empty() {
                return Err(Error::StorageError("invalid url".to_string()));
            }
            Box::<MemoryActionCacheService>::default()
        }
        "simplefs" => {
            if url.has_host() || url.path().is_empty() {
                return Err(Error::StorageError(
                    "simplefs needs a path and no host".to_string(),
                ));
            }
            if url.path() == "/" {
                return Err(Error::StorageError(
                    "cowardly refusing to use / as action cache".to_string(),
                ));
            }
            Box::new(SimpleFilesystemActionCacheService::new(url.path().into()).await?)
        }
        scheme => {
            return Err(Error::StorageError(format!("unknown scheme: {}", scheme)));
        }
    };

    Ok(action_cache)
}
