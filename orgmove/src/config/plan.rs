//! Plan file schema and the mapping onto runtime descriptors

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::settings::{ExecutionSettings, SettingsOverrides};
use crate::error::{MigrationError, Result};
use crate::model::{
    ApiMode, CrudOperation, EntityDescriptor, FieldMapping, PolymorphicLookup, QuerySpec,
    ValueTransform, split_external_id,
};
use crate::remote::{Endpoint, HttpOrgConnection, OrgCredentials};

/// A complete migration plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPlan {
    #[serde(default)]
    pub settings: ExecutionSettings,
    pub source: EndpointConfig,
    pub target: EndpointConfig,
    /// Entities never auto-added as lookup placeholders
    #[serde(default)]
    pub excluded_objects: Vec<String>,
    /// Objects of the implicit default object-set
    #[serde(default)]
    pub objects: Vec<ObjectConfig>,
    #[serde(default)]
    pub object_sets: Vec<ObjectSetConfig>,
}

/// Where records come from or go to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndpointConfig {
    /// A connected org; credentials inline or read from `<env_prefix>_*` variables
    Org {
        name: String,
        #[serde(default)]
        instance_url: Option<String>,
        #[serde(default)]
        access_token: Option<String>,
        #[serde(default)]
        api_version: Option<String>,
        #[serde(default)]
        env_prefix: Option<String>,
    },
    /// A directory of `<Entity>.csv` files
    Csv { directory: PathBuf },
}

impl EndpointConfig {
    /// Resolve relative CSV directories against the plan file's directory
    pub fn resolve_relative(&mut self, base: &Path) {
        if let EndpointConfig::Csv { directory } = self {
            if directory.is_relative() {
                *directory = base.join(&*directory);
            }
        }
    }

    /// Open the endpoint
    pub fn connect(&self) -> Result<Endpoint> {
        match self {
            EndpointConfig::Csv { directory } => Ok(Endpoint::csv(directory.clone())),
            EndpointConfig::Org {
                name,
                instance_url,
                access_token,
                api_version,
                env_prefix,
            } => {
                let credentials = match (instance_url, access_token) {
                    (Some(url), Some(token)) => OrgCredentials {
                        name: name.clone(),
                        instance_url: url.trim_end_matches('/').to_string(),
                        access_token: token.clone(),
                        api_version: api_version
                            .clone()
                            .unwrap_or_else(|| crate::remote::DEFAULT_API_VERSION.to_string()),
                    },
                    _ => {
                        let prefix = env_prefix
                            .clone()
                            .unwrap_or_else(|| name.to_ascii_uppercase().replace('-', "_"));
                        OrgCredentials::from_env(name, &prefix)?
                    }
                };
                Ok(Endpoint::Org(Arc::new(HttpOrgConnection::new(credentials))))
            }
        }
    }

    pub fn is_org(&self) -> bool {
        matches!(self, EndpointConfig::Org { .. })
    }
}

/// A partition of entities run as its own job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectSetConfig {
    pub name: String,
    #[serde(default)]
    pub settings: SettingsOverrides,
    /// Single CSV file holding rows of several entities
    #[serde(default)]
    pub composite_feed: Option<CompositeFeedConfig>,
    pub objects: Vec<ObjectConfig>,
}

/// Combined source file split per entity by a discriminator column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeFeedConfig {
    /// File name relative to the source directory
    pub file: String,
    /// Column naming the entity of each row
    #[serde(default = "default_entity_column")]
    pub entity_column: String,
}

fn default_entity_column() -> String {
    "Entity".to_string()
}

/// One entity as declared in the plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectConfig {
    pub query: String,
    pub operation: String,
    /// External-Id field(s); composite keys are `;`-separated
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub delete_old_data: bool,
    #[serde(default)]
    pub api_mode: ApiMode,
    #[serde(default)]
    pub excluded_fields: Vec<String>,
    #[serde(default)]
    pub polymorphic_lookups: Vec<PolymorphicLookup>,
    #[serde(default)]
    pub field_mapping: Option<FieldMapping>,
    #[serde(default)]
    pub transforms: Vec<ValueTransform>,
}

impl ObjectConfig {
    /// Map the declaration onto a descriptor
    pub fn to_descriptor(&self) -> Result<EntityDescriptor> {
        let query = QuerySpec::parse(&self.query)?;
        let operation: CrudOperation = self.operation.parse().map_err(|e: String| {
            MigrationError::configuration(format!("{} for {}", e, query.entity))
        })?;

        let mut descriptor = EntityDescriptor::new(query, operation);
        descriptor.external_id = self
            .external_id
            .as_deref()
            .map(split_external_id)
            .unwrap_or_default();
        descriptor.delete_old_data = self.delete_old_data;
        descriptor.api_mode = self.api_mode;
        descriptor.excluded_fields = self.excluded_fields.clone();
        descriptor.polymorphic_lookups = self.polymorphic_lookups.clone();
        descriptor.field_mapping = self.field_mapping.clone();
        descriptor.transforms = self.transforms.clone();
        Ok(descriptor)
    }
}

/// A resolved object-set ready to run
#[derive(Debug, Clone)]
pub struct ObjectSet {
    pub name: String,
    pub settings: ExecutionSettings,
    pub composite_feed: Option<CompositeFeedConfig>,
    pub descriptors: Vec<EntityDescriptor>,
}

impl MigrationPlan {
    /// Check the plan for errors that need no remote access
    pub fn validate(&self) -> Result<()> {
        self.settings
            .validate()
            .map_err(MigrationError::configuration)?;
        if self.objects.is_empty() && self.object_sets.is_empty() {
            return Err(MigrationError::configuration("Plan declares no objects"));
        }
        for set in self.object_sets()? {
            set.settings
                .validate()
                .map_err(MigrationError::configuration)?;
        }
        Ok(())
    }

    /// Object-sets in declaration order; top-level `objects` form the first set
    pub fn object_sets(&self) -> Result<Vec<ObjectSet>> {
        let mut sets = Vec::new();
        if !self.objects.is_empty() {
            sets.push(ObjectSet {
                name: "default".to_string(),
                settings: self.settings.clone(),
                composite_feed: None,
                descriptors: Self::descriptors("default", &self.objects)?,
            });
        }
        for set in &self.object_sets {
            sets.push(ObjectSet {
                name: set.name.clone(),
                settings: self.settings.with_overrides(&set.settings),
                composite_feed: set.composite_feed.clone(),
                descriptors: Self::descriptors(&set.name, &set.objects)?,
            });
        }
        Ok(sets)
    }

    fn descriptors(set_name: &str, objects: &[ObjectConfig]) -> Result<Vec<EntityDescriptor>> {
        let mut seen = HashSet::new();
        let mut descriptors = Vec::with_capacity(objects.len());
        for object in objects {
            let descriptor = object.to_descriptor()?;
            if !seen.insert(descriptor.name.to_ascii_lowercase()) {
                return Err(MigrationError::configuration(format!(
                    "{} is declared twice in object-set '{}'",
                    descriptor.name, set_name
                )));
            }
            descriptors.push(descriptor);
        }
        Ok(descriptors)
    }
}
