pub mod config;
pub mod error;
pub mod fs;
pub mod logging;
pub mod s3;
pub mod tree;
