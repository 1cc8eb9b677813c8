//! Durable `(partition, row)` keyed storage for session records.

mod errors;
mod memory;
mod sled_repo;
mod traits;

pub use errors::{DbError, DbResult};
pub use memory::InMemoryRepository;
pub use sled_repo::SledRepository;
pub use traits::{replace, Entry, MergeFn, Repository, RepositoryExt};
