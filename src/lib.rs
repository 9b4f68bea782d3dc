pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod deploy;
pub mod error;
pub mod exif;
pub mod hashing;
pub mod identity;
pub mod metadata;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod remote;
pub mod runtime;
pub mod stats;
pub mod storage;
pub mod transform;
pub mod util;

pub use cli::run_cli;
