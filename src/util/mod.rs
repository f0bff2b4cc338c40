//! Shared concurrency and caching primitives

pub mod cache;
pub mod striped;

pub use cache::{FileIndex, FileIndexCache};
pub use striped::StripedMutex;
