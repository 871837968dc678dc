use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::path::Path;
use tracing::info;

#[derive(Debug)]
pub enum SchemaError {
    Io(String),
    Parse(String),
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaError::Io(msg) => write!(f, "Failed to read schema file: {}", msg),
            SchemaError::Parse(msg) => write!(f, "Invalid schema file: {}", msg),
        }
    }
}

impl Error for SchemaError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub references: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    pub sample_queries: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub description: String,
}

/// Read-only description of the database, loaded once at start-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaMetadata {
    #[serde(default)]
    pub description: String,
    pub tables: Vec<TableInfo>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    #[serde(default)]
    pub business_rules: Vec<String>,
}

impl SchemaMetadata {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SchemaError::Io(format!("{}: {}", path.display(), e)))?;
        let schema = Self::from_json(&content)?;
        info!("Loaded schema metadata for {} tables from {}", schema.tables.len(), path.display());
        Ok(schema)
    }

    pub fn from_json(content: &str) -> Result<Self, SchemaError> {
        let schema: SchemaMetadata =
            serde_json::from_str(content).map_err(|e| SchemaError::Parse(e.to_string()))?;
        if schema.tables.is_empty() {
            return Err(SchemaError::Parse("schema declares no tables".to_string()));
        }
        Ok(schema)
    }

    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// Text handed to the SQL generator as schema context.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        if !self.description.is_empty() {
            out.push_str(&format!("Database: {}\n\n", self.description));
        }

        out.push_str("Tables:\n");
        for table in &self.tables {
            out.push_str(&format!("\n{}: {}\n  Columns:\n", table.name, table.description));
            for col in &table.columns {
                out.push_str(&format!("    - {} ({}): {}\n", col.name, col.data_type, col.description));
            }
            for fk in &table.foreign_keys {
                out.push_str(&format!("  Foreign key: {} -> {}\n", fk.column, fk.references));
            }
            for sample in &table.sample_queries {
                out.push_str(&format!("  Example: {}\n", sample));
            }
        }

        if !self.relationships.is_empty() {
            out.push_str("\nRelationships:\n");
            for rel in &self.relationships {
                out.push_str(&format!("  - {} ({} -> {})\n", rel.description, rel.from, rel.to));
            }
        }

        if !self.business_rules.is_empty() {
            out.push_str("\nBusiness Rules:\n");
            for rule in &self.business_rules {
                out.push_str(&format!("  - {}\n", rule));
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUNDLED: &str = include_str!("../../schema/property_management.json");

    #[test]
    fn bundled_schema_parses() {
        let schema = SchemaMetadata::from_json(BUNDLED).unwrap();
        let names: Vec<&str> = schema.tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Owners", "Properties", "Units", "Leases"]);
        assert!(schema.table("properties").is_some());
    }

    #[test]
    fn describe_lists_columns_and_rules() {
        let text = SchemaMetadata::from_json(BUNDLED).unwrap().describe();
        assert!(text.contains("- owner_id (INTEGER)"));
        assert!(text.contains("Foreign key: unit_id -> Units.unit_id"));
        assert!(text.contains("Business Rules:"));
    }

    #[test]
    fn rejects_empty_and_malformed_documents() {
        assert!(matches!(SchemaMetadata::from_json("{\"tables\": []}"), Err(SchemaError::Parse(_))));
        assert!(matches!(SchemaMetadata::from_json("not json"), Err(SchemaError::Parse(_))));
        assert!(matches!(SchemaMetadata::load("/nonexistent/schema.json"), Err(SchemaError::Io(_))));
    }
}
