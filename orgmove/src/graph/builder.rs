//! Schedule builder: resolves lookups from metadata, auto-adds undeclared
//! parents and produces the ordered descriptor list

use std::collections::HashMap;

use log::{debug, info, warn};

use super::dependency_graph::{DependencyGraph, PINNED_ENTITY};
use crate::error::{MigrationError, Result};
use crate::metadata::{DescribeCache, EntityDescribe, Side};
use crate::model::{EntityDescriptor, ID_FIELD, LookupField, split_external_id};

/// Composite business key of the record-type entity
pub const RECORD_TYPE_EXTERNAL_ID: &str = "DeveloperName;NamespacePrefix;SobjectType";

/// Descriptors in execution order plus the graph they were ordered by
#[derive(Debug, Clone)]
pub struct Schedule {
    pub descriptors: Vec<EntityDescriptor>,
    pub graph: DependencyGraph,
}

impl Schedule {
    pub fn execution_order(&self) -> Vec<&str> {
        self.descriptors.iter().map(|d| d.name.as_str()).collect()
    }

    /// Reverse dependency order used by deletes
    pub fn delete_order(&self) -> Vec<String> {
        self.graph.delete_order()
    }

    pub fn descriptor(&self, name: &str) -> Option<&EntityDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    pub fn auto_added(&self) -> Vec<&str> {
        self.descriptors
            .iter()
            .filter(|d| d.is_auto_added)
            .map(|d| d.name.as_str())
            .collect()
    }
}

/// Default business key when the plan declares none
pub fn default_external_id(entity: &str, describe: &EntityDescribe) -> Vec<String> {
    if entity == PINNED_ENTITY {
        return split_external_id(RECORD_TYPE_EXTERNAL_ID);
    }
    match describe.name_field() {
        Some(field) => vec![field.name.clone()],
        None => vec![ID_FIELD.to_string()],
    }
}

/// Fail when an operation that pairs records by business key has a key
/// metadata cannot resolve
fn validate_external_id(descriptor: &EntityDescriptor, describe: &EntityDescribe) -> Result<()> {
    if !descriptor.operation.requires_external_id_match() {
        return Ok(());
    }
    if descriptor.external_id.is_empty() {
        return Err(MigrationError::configuration(format!(
            "{} requires an external Id for {}",
            descriptor.name, descriptor.operation
        )));
    }
    for field in &descriptor.external_id {
        let resolvable = match field.split_once('.') {
            Some((relationship, _)) => describe.lookup_by_relationship(relationship).is_some(),
            None => describe.has_field(field),
        };
        if !resolvable {
            return Err(MigrationError::configuration(format!(
                "External Id field '{}' of {} is not defined in metadata",
                field, descriptor.name
            )));
        }
    }
    Ok(())
}

/// Lookup fields of the query, with referenced entities named on the source side
async fn resolve_lookups(
    descriptor: &EntityDescriptor,
    describe: &EntityDescribe,
    cache: &DescribeCache,
    target_to_source: &HashMap<String, String>,
) -> Result<Vec<LookupField>> {
    let to_source = |name: &str| {
        target_to_source
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    };

    let mut lookups = Vec::new();
    for field_name in descriptor.query.direct_fields() {
        let Some(field) = describe.field(field_name).filter(|f| f.is_lookup) else {
            continue;
        };
        let relationship = field
            .relationship_name
            .clone()
            .unwrap_or_else(|| field.name.trim_end_matches("Id").to_string());

        let referenced: Vec<String> = if field.is_polymorphic {
            let declared = descriptor
                .polymorphic_lookups
                .iter()
                .find(|p| p.field.eq_ignore_ascii_case(&field.name));
            match declared {
                Some(p) if !p.targets.is_empty() => p.targets.clone(),
                _ => cache
                    .polymorphic_targets(
                        descriptor.target_entity(),
                        descriptor.target_field(&field.name),
                    )
                    .await?
                    .iter()
                    .map(|t| to_source(t))
                    .collect(),
            }
        } else {
            field.referenced_entities.iter().map(|t| to_source(t)).collect()
        };

        lookups.push(LookupField {
            field: field.name.clone(),
            relationship,
            referenced_entities: referenced,
            is_polymorphic: field.is_polymorphic,
        });
    }
    Ok(lookups)
}

/// Resolve lookups, apply default external Ids, auto-add undeclared parents
/// and order everything by dependency
pub async fn build_schedule(
    mut descriptors: Vec<EntityDescriptor>,
    cache: &mut DescribeCache,
    excluded_objects: &[String],
) -> Result<Schedule> {
    let target_to_source: HashMap<String, String> = descriptors
        .iter()
        .filter(|d| d.target_entity() != d.name)
        .map(|d| (d.target_entity().to_string(), d.name.clone()))
        .collect();
    let is_excluded = |name: &str| excluded_objects.iter().any(|e| e.eq_ignore_ascii_case(name));

    let mut graph = DependencyGraph::new();
    for descriptor in &descriptors {
        graph.add_entity(&descriptor.name);
    }

    let mut placeholders: Vec<EntityDescriptor> = Vec::new();
    for descriptor in descriptors.iter_mut() {
        let describe = cache.describe(&descriptor.name, Side::Source).await?;

        if descriptor.external_id.is_empty() {
            descriptor.external_id = default_external_id(&descriptor.name, &describe);
            debug!(
                "{}: using default external Id {}",
                descriptor.name,
                descriptor.external_id.join(";")
            );
        }
        validate_external_id(descriptor, &describe)?;
        for field in descriptor.external_id.clone() {
            if field != ID_FIELD {
                descriptor.query.add_field(field);
            }
        }

        let lookups = resolve_lookups(descriptor, &describe, cache, &target_to_source).await?;
        let mut kept = Vec::with_capacity(lookups.len());
        for lookup in lookups {
            let mut in_scope = false;
            for referenced in &lookup.referenced_entities {
                if graph.contains(referenced) {
                    graph.add_dependency(&descriptor.name, referenced);
                    in_scope = true;
                } else if lookup.is_polymorphic {
                    continue;
                } else if is_excluded(referenced) {
                    warn!(
                        "{}.{} references excluded object {}; the field is not migrated",
                        descriptor.name, lookup.field, referenced
                    );
                } else {
                    let parent = cache.describe(referenced, Side::Source).await?;
                    let placeholder = EntityDescriptor::placeholder(
                        referenced.clone(),
                        default_external_id(referenced, &parent),
                    );
                    info!(
                        "Auto-added {} (referenced by {}.{})",
                        referenced, descriptor.name, lookup.field
                    );
                    graph.add_dependency(&descriptor.name, referenced);
                    placeholders.push(placeholder);
                    in_scope = true;
                }
            }

            if in_scope {
                kept.push(lookup);
            } else {
                debug!(
                    "{}.{} has no target in scope; the field is not migrated",
                    descriptor.name, lookup.field
                );
                descriptor.excluded_fields.push(lookup.field.clone());
            }
        }
        descriptor.lookup_fields = kept;
    }
    descriptors.extend(placeholders);

    for cycle in graph.cycles() {
        warn!(
            "Circular lookups between {}; unresolved values are filled in after all objects run",
            cycle.join(", ")
        );
    }

    let mut by_name: HashMap<String, EntityDescriptor> = descriptors
        .into_iter()
        .map(|d| (d.name.clone(), d))
        .collect();
    let ordered: Vec<EntityDescriptor> = graph
        .execution_order()
        .iter()
        .filter_map(|name| by_name.remove(name))
        .collect();

    Ok(Schedule {
        descriptors: ordered,
        graph,
    })
}
