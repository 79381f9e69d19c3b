//! Builds the model registry from a database catalog.

pub mod adapter;
pub mod options;
pub mod postgres;

pub use adapter::Adapter;
pub use options::IntrospectOptions;
pub use postgres::{PostgresAdapter, load_models, load_models_with_options};

pub use dbscrub_core::ModelRegistry;
