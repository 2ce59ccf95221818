//! Entity query: field list plus filter
//!
//! Plans declare queries in SOQL form:
//! `SELECT Id, Name, AccountId FROM Contact WHERE Email != null ORDER BY Name LIMIT 500`.
//! `SELECT all FROM Account` selects every describable field; it is expanded
//! during Setup once metadata is known.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{MigrationError, Result};

static QUERY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)^\s*select\s+(?P<fields>.+?)\s+from\s+(?P<entity>[A-Za-z_][A-Za-z0-9_]*)(?:\s+where\s+(?P<filter>.+?))?(?:\s+order\s+by\s+(?P<order>.+?))?(?:\s+limit\s+(?P<limit>\d+))?\s*$",
    )
    .expect("query pattern is valid")
});

static FIELD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$").expect("field pattern is valid")
});

/// Keyword selecting every field
pub const ALL_FIELDS: &str = "all";

/// Parsed entity query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    pub entity: String,
    pub fields: Vec<String>,
    pub filter: Option<String>,
    pub order_by: Option<String>,
    pub limit: Option<usize>,
    /// `SELECT all` was used; `fields` is filled in at Setup
    pub all_fields: bool,
}

impl QuerySpec {
    /// Parse a SOQL-style query
    pub fn parse(text: &str) -> Result<Self> {
        let caps = QUERY_RE
            .captures(text)
            .ok_or_else(|| MigrationError::configuration(format!("Malformed query: {}", text)))?;

        let entity = caps["entity"].to_string();
        let raw_fields: Vec<String> = caps["fields"]
            .split(',')
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();

        let all_fields = raw_fields.iter().any(|f| f.eq_ignore_ascii_case(ALL_FIELDS));
        let mut spec = QuerySpec {
            entity,
            fields: Vec::new(),
            filter: caps.name("filter").map(|m| m.as_str().trim().to_string()),
            order_by: caps.name("order").map(|m| m.as_str().trim().to_string()),
            limit: caps
                .name("limit")
                .and_then(|m| m.as_str().parse().ok()),
            all_fields,
        };

        for field in raw_fields {
            if field.eq_ignore_ascii_case(ALL_FIELDS) {
                continue;
            }
            if !FIELD_RE.is_match(&field) {
                return Err(MigrationError::configuration(format!(
                    "Malformed field '{}' in query for {}",
                    field, spec.entity
                )));
            }
            spec.add_field(field);
        }

        if spec.fields.is_empty() && !spec.all_fields {
            return Err(MigrationError::configuration(format!(
                "Query for {} selects no fields",
                spec.entity
            )));
        }

        Ok(spec)
    }

    /// Minimal query selecting the given fields
    pub fn select(entity: impl Into<String>, fields: &[&str]) -> Self {
        let mut spec = QuerySpec {
            entity: entity.into(),
            fields: Vec::new(),
            filter: None,
            order_by: None,
            limit: None,
            all_fields: false,
        };
        for field in fields {
            spec.add_field(*field);
        }
        spec
    }

    /// Add a field unless already selected (case-insensitive); returns whether added
    pub fn add_field(&mut self, field: impl Into<String>) -> bool {
        let field = field.into();
        if self.has_field(&field) {
            return false;
        }
        self.fields.push(field);
        true
    }

    /// Whether the field is selected (case-insensitive)
    pub fn has_field(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f.eq_ignore_ascii_case(field))
    }

    /// Plain fields (no relationship paths)
    pub fn direct_fields(&self) -> impl Iterator<Item = &String> {
        self.fields.iter().filter(|f| !f.contains('.'))
    }

    /// Render back to SOQL
    pub fn to_soql(&self) -> String {
        let mut soql = format!("SELECT {} FROM {}", self.fields.join(", "), self.entity);
        if let Some(filter) = &self.filter {
            soql.push_str(" WHERE ");
            soql.push_str(filter);
        }
        if let Some(order) = &self.order_by {
            soql.push_str(" ORDER BY ");
            soql.push_str(order);
        }
        if let Some(limit) = self.limit {
            soql.push_str(&format!(" LIMIT {}", limit));
        }
        soql
    }
}

impl fmt::Display for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_soql())
    }
}
