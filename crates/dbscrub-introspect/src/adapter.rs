use async_trait::async_trait;

use dbscrub_core::{ModelRegistry, Result};

use crate::options::IntrospectOptions;

/// Trait implemented by database adapters that can enumerate models.
#[async_trait]
pub trait Adapter {
    /// Returns the engine identifier (e.g. `postgres`).
    fn engine(&self) -> &'static str;

    /// Read the catalog and return every model with its fields and relations.
    async fn load_models(&self, opts: &IntrospectOptions) -> Result<ModelRegistry>;
}
