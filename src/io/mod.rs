//! Collaborators reached by recipes: fetching, caching, decoding, input metadata and storing.

pub mod cache;
pub mod codec;
pub mod fetch;
pub mod metadata;
pub mod target;

#[cfg_attr(docsrs, doc(cfg(feature = "glob-patterns")))]
#[cfg(feature = "glob-patterns")]
pub mod glob;

pub use cache::{CacheStore, FsCache, MemoryCache};
pub use codec::{ArrayCodec, JsonCodec};
pub use fetch::{LocalFetcher, SourceFetcher};
pub use metadata::{FsMetadata, InputMetadata, MemoryMetadata, MetadataStore, VariableSchema};
pub use target::{ArraySchema, FsTarget, StoreSchema, TargetStore};
