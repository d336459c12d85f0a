//! Artifact and cache storage for Conduit.
//!
//! Artifacts are run-scoped and immutable once put; cache entries are keyed,
//! shared across runs and strictly best-effort.

pub mod archiver;
pub mod artifact;
pub mod compression;
pub mod keys;
pub mod store;
pub mod transport;
pub mod types;

pub use artifact::{FilesystemArtifactStore, MemoryArtifactStore, RunArtifacts};
pub use compression::{compress, decompress};
pub use keys::{cache_key, digest, encode_segment, matches_prefix, sanitize_key};
pub use store::{FilesystemCacheStore, MemoryCacheStore};
pub use transport::{ArtifactTransport, CacheTransport};
pub use types::{CacheEntry, CompressionType};
