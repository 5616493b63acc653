pub mod config;
pub mod error;
pub mod global;
pub mod http;
pub mod kubernetes;
pub mod metrics;
pub mod mirror;
pub mod supervisor;

pub use error::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;
