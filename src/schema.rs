//! Staging table layout and SQL generation for dataverse-sync.
//!
//! Every staging location has the same two-column shape: the raw record as
//! `jsonb` and the time it was pulled. Transform SQL reads from these tables.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Column holding the raw record.
pub const PAYLOAD_COLUMN: &str = "payload";

/// Column holding the ingestion timestamp.
pub const PULLED_AT_COLUMN: &str = "pulled_at";

/// Default schema for staging tables.
pub const DEFAULT_STAGING_SCHEMA: &str = "staging";

/// Schema-qualified destination for one job's raw records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StagingLocation {
    /// Schema name
    pub schema: String,
    /// Table name
    pub table: String,
}

impl StagingLocation {
    /// Create a new staging location.
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Quoted `"schema"."table"` for use in SQL.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    /// `CREATE SCHEMA IF NOT EXISTS` statement.
    pub fn create_schema_ddl(&self) -> String {
        format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&self.schema))
    }

    /// `CREATE TABLE IF NOT EXISTS` statement with the staging layout.
    pub fn create_table_ddl(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {} jsonb NOT NULL,\n    {} timestamptz NOT NULL DEFAULT now()\n)",
            self.qualified_name(),
            PAYLOAD_COLUMN,
            PULLED_AT_COLUMN
        )
    }

    /// `TRUNCATE TABLE` statement.
    pub fn truncate_sql(&self) -> String {
        format!("TRUNCATE TABLE {}", self.qualified_name())
    }

    /// Row count query.
    pub fn count_sql(&self) -> String {
        format!("SELECT COUNT(*) FROM {}", self.qualified_name())
    }

    /// Multi-row insert for `rows` payloads.
    ///
    /// Payloads bind to `$1..$rows`; the shared timestamp binds to
    /// `$rows + 1`.
    pub fn insert_sql(&self, rows: usize) -> String {
        let ts_param = rows + 1;
        let values: Vec<String> = (1..=rows)
            .map(|i| format!("(${}, ${})", i, ts_param))
            .collect();

        format!(
            "INSERT INTO {} ({}, {}) VALUES {}",
            self.qualified_name(),
            PAYLOAD_COLUMN,
            PULLED_AT_COLUMN,
            values.join(", ")
        )
    }
}

impl fmt::Display for StagingLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Quote a PostgreSQL identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
