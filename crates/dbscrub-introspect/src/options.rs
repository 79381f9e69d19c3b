use dbscrub_core::Settings;

/// Which catalog relations become models.
#[derive(Debug, Clone)]
pub struct IntrospectOptions {
    /// Only these schemas; every non-system schema when unset.
    pub schemas: Option<Vec<String>>,
    /// Keep views and materialized views as proxy models.
    pub proxies: bool,
    /// Keep foreign tables as unmanaged models.
    pub foreign_tables: bool,
    pub system_schemas: bool,
}

impl Default for IntrospectOptions {
    fn default() -> Self {
        Self {
            schemas: None,
            proxies: true,
            foreign_tables: true,
            system_schemas: false,
        }
    }
}

impl IntrospectOptions {
    /// Leave out relations a run with these settings never touches.
    pub fn for_settings(settings: &Settings) -> Self {
        Self {
            proxies: false,
            foreign_tables: !settings.skip_unmanaged,
            ..Self::default()
        }
    }
}
