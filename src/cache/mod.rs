//! Local mirror cache.
//!
//! Provides the normalized [`RepositoryIdentity`] used as the cache key, the
//! on-disk [`MirrorStore`] holding one bare mirror per upstream repository,
//! a [`CacheManager`] that evicts least-recently-used mirrors when the cache
//! grows past its high-water mark, and the [`PackCache`] of generated
//! upload-pack responses.

pub mod identity;
pub mod manager;
pub mod pack;
pub mod store;

pub use identity::{IdentityError, RepositoryIdentity};
pub use manager::CacheManager;
pub use pack::{Filled, PackCache, PackKey, PackReader};
pub use store::{MirrorReadGuard, MirrorRecord, MirrorStore, SyncStatus};
