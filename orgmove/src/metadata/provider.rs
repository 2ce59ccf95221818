//! Metadata provider seam and the per-job describe cache

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use super::models::{EntityDescribe, Side};
use crate::error::{MigrationError, Result};
use crate::remote::OrgConnection;

/// Resolves per-entity and per-field capabilities
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Describe an entity on one side of the migration
    async fn describe_entity(&self, name: &str, side: Side) -> Result<EntityDescribe>;

    /// Entities a polymorphic lookup can reference
    async fn polymorphic_targets(&self, entity: &str, field: &str) -> Result<Vec<String>> {
        let describe = self.describe_entity(entity, Side::Target).await?;
        Ok(describe
            .field(field)
            .map(|f| f.referenced_entities.clone())
            .unwrap_or_default())
    }
}

/// Metadata backed by the job's org endpoints
///
/// A CSV endpoint has no metadata of its own; requests for that side are
/// answered by the org on the other side.
pub struct EndpointMetadata {
    source: Option<Arc<dyn OrgConnection>>,
    target: Option<Arc<dyn OrgConnection>>,
}

impl EndpointMetadata {
    pub fn new(
        source: Option<Arc<dyn OrgConnection>>,
        target: Option<Arc<dyn OrgConnection>>,
    ) -> Self {
        Self { source, target }
    }

    fn connection_for(&self, side: Side) -> Option<&Arc<dyn OrgConnection>> {
        match side {
            Side::Source => self.source.as_ref().or(self.target.as_ref()),
            Side::Target => self.target.as_ref().or(self.source.as_ref()),
        }
    }
}

#[async_trait]
impl MetadataProvider for EndpointMetadata {
    async fn describe_entity(&self, name: &str, side: Side) -> Result<EntityDescribe> {
        let connection = self.connection_for(side).ok_or_else(|| {
            MigrationError::configuration(
                "At least one endpoint must be an org to resolve entity metadata",
            )
        })?;
        connection.describe(name).await
    }
}

/// Describe results cached per entity and side for the job's lifetime
pub struct DescribeCache {
    provider: Arc<dyn MetadataProvider>,
    entries: HashMap<(Side, String), Arc<EntityDescribe>>,
}

impl DescribeCache {
    pub fn new(provider: Arc<dyn MetadataProvider>) -> Self {
        Self {
            provider,
            entries: HashMap::new(),
        }
    }

    /// Describe an entity, hitting the provider only on first use
    pub async fn describe(&mut self, name: &str, side: Side) -> Result<Arc<EntityDescribe>> {
        let key = (side, name.to_string());
        if let Some(cached) = self.entries.get(&key) {
            return Ok(Arc::clone(cached));
        }

        debug!("Describing {} ({})", name, side.label());
        let describe = Arc::new(self.provider.describe_entity(name, side).await?);
        self.entries.insert(key, Arc::clone(&describe));
        Ok(describe)
    }

    /// Previously cached describe, without a remote call
    pub fn cached(&self, name: &str, side: Side) -> Option<Arc<EntityDescribe>> {
        self.entries.get(&(side, name.to_string())).cloned()
    }

    /// Entities a polymorphic lookup can reference
    pub async fn polymorphic_targets(&self, entity: &str, field: &str) -> Result<Vec<String>> {
        self.provider.polymorphic_targets(entity, field).await
    }

    /// Number of cached describes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
