pub mod errors;
pub mod executor;
pub mod image;
pub mod materialize;
pub mod merkle;
pub mod service;

pub use errors::Error;
