pub mod db;
pub mod domain;
pub mod error;

pub use db::{BucketStore, MemoryBucketStore, PgBucketStore};
pub use error::StoreError;
