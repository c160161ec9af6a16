use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Column types the translator needs to know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    Int,
    BigInt,
    Float,
    Text,
    Date,
    Timestamp,
    Json,
}

impl DataType {
    pub fn label(&self) -> &'static str {
        match self {
            DataType::Bool => "boolean",
            DataType::Int => "integer",
            DataType::BigInt => "bigint",
            DataType::Float => "double precision",
            DataType::Text => "text",
            DataType::Date => "date",
            DataType::Timestamp => "timestamp",
            DataType::Json => "jsonb",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyMetadata {
    pub name: String,
    pub column: String,
    pub data_type: DataType,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
}

/// Mapping of one entity set onto a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub name: String,
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default)]
    pub properties: Vec<PropertyMetadata>,
}

impl EntityMetadata {
    pub fn new(name: &str, table: &str) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            schema: None,
            properties: Vec::new(),
        }
    }

    pub fn with_schema(mut self, schema: &str) -> Self {
        self.schema = Some(schema.to_string());
        self
    }

    /// Add a non-null property whose column has the same name.
    pub fn property(self, name: &str, data_type: DataType) -> Self {
        self.column(name, name, data_type, false)
    }

    pub fn nullable_property(self, name: &str, data_type: DataType) -> Self {
        self.column(name, name, data_type, true)
    }

    pub fn key(mut self, name: &str, data_type: DataType) -> Self {
        self.properties.push(PropertyMetadata {
            name: name.to_string(),
            column: name.to_string(),
            data_type,
            nullable: false,
            primary_key: true,
        });
        self
    }

    pub fn column(mut self, name: &str, column: &str, data_type: DataType, nullable: bool) -> Self {
        self.properties.push(PropertyMetadata {
            name: name.to_string(),
            column: column.to_string(),
            data_type,
            nullable,
            primary_key: false,
        });
        self
    }

    /// Exact match first, then case-insensitive.
    pub fn find(&self, name: &str) -> Option<&PropertyMetadata> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .or_else(|| self.properties.iter().find(|p| p.name.eq_ignore_ascii_case(name)))
    }

    pub fn primary_key(&self) -> Vec<&PropertyMetadata> {
        self.properties.iter().filter(|p| p.primary_key).collect()
    }
}

/// Entity sets known to a provider, looked up by entity name.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entities: HashMap<String, Arc<EntityMetadata>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, entity: EntityMetadata) -> Self {
        self.register(entity);
        self
    }

    pub fn register(&mut self, entity: EntityMetadata) {
        self.entities.insert(entity.name.clone(), Arc::new(entity));
    }

    pub fn entity(&self, name: &str) -> Option<Arc<EntityMetadata>> {
        self.entities.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entities.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl FromIterator<EntityMetadata> for Catalog {
    fn from_iter<I: IntoIterator<Item = EntityMetadata>>(iter: I) -> Self {
        let mut catalog = Catalog::new();
        for entity in iter {
            catalog.register(entity);
        }
        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_property_case_insensitive() {
        let customer = EntityMetadata::new("Customer", "customers")
            .key("id", DataType::Int)
            .property("name", DataType::Text);
        assert_eq!(customer.find("name").map(|p| p.column.as_str()), Some("name"));
        assert_eq!(customer.find("Name").map(|p| p.column.as_str()), Some("name"));
        assert!(customer.find("missing").is_none());
    }

    #[test]
    fn test_primary_key() {
        let customer = EntityMetadata::new("Customer", "customers")
            .key("id", DataType::Int)
            .property("name", DataType::Text);
        let keys = customer.primary_key();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].name, "id");
    }

    #[test]
    fn test_catalog_lookup() {
        let catalog: Catalog = vec![
            EntityMetadata::new("Customer", "customers"),
            EntityMetadata::new("Order", "orders").with_schema("sales"),
        ]
        .into_iter()
        .collect();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.names(), vec!["Customer", "Order"]);
        assert_eq!(
            catalog.entity("Order").and_then(|e| e.schema.clone()),
            Some("sales".to_string())
        );
        assert!(catalog.entity("Invoice").is_none());
    }

    #[test]
    fn test_data_type_label() {
        assert_eq!(DataType::Float.label(), "double precision");
        assert_eq!(DataType::Json.label(), "jsonb");
    }
}
