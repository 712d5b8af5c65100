pub mod db;
pub mod domain;
pub mod engine;
pub mod error;

pub use engine::MeteringEngine;
pub use error::{ConfigError, SendError, StorageError};
