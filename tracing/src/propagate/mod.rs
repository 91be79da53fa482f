#[cfg(feature = "tonic")]
pub mod tonic;
