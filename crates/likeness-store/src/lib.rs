//! likeness-store: concrete backends for the record and object store seams
//! defined in `likeness-core`.

pub mod kv;
pub mod object;

pub use kv::SqliteKvStore;
pub use object::{FsObjectStore, S3ObjectStore};
