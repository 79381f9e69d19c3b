//! Synthetic values for pooled faker scrubbers.
//!
//! The pool is a cache table holding `entries_per_provider` values for every
//! `(provider, locale)` pair; update statements read it through `mod_pk`.

pub mod errors;
pub mod faker;
pub mod pool;

pub use errors::GenerationError;
pub use faker::{FakerCatalog, LocaleKey};
pub use pool::{FakeDataPool, PoolReport};
