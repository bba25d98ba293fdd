//! Local Cache Store: key/blob persistence that survives process restarts.
//!
//! [`CacheStore`] is the raw device contract. [`LocalCache`] layers typed, versioned blobs and an
//! in-memory mirror on top so that a failing device store degrades to the last known value instead
//! of surfacing an error to gameplay code.

mod blob;
mod file;
pub mod keys;
mod store;

pub use blob::{CachedBlob, LocalCache};
pub use file::FileCacheStore;
pub use store::{CacheStore, InMemoryCacheStore};
