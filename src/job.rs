//! Table jobs and job selection.
//!
//! A job maps one Dataverse entity set to one staging table, with an
//! optional transform statement run after the load. The registry is an
//! ordered list: jobs always run in the order they are declared, so lookup
//! tables can be listed before the tables that reference them.

use crate::error::{Error, Result};
use crate::schema::{DEFAULT_STAGING_SCHEMA, StagingLocation};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use url::Url;
use validator::Validate;

/// Web API path appended to the environment base URL.
pub const API_PATH: &str = "api/data/v9.2/";

/// One configured unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Job {
    /// Logical key, unique within the registry
    #[validate(length(min = 1, max = 128))]
    pub key: String,

    /// Entity set name (URL path segment)
    #[validate(length(min = 1))]
    #[serde(alias = "entityset")]
    pub entity_set: String,

    /// Optional `$select` expression
    #[serde(default)]
    pub select: Option<String>,

    /// Optional `$filter` expression
    #[serde(default)]
    pub filter: Option<String>,

    /// Staging schema
    #[validate(length(min = 1, max = 63))]
    #[serde(default = "default_staging_schema")]
    pub staging_schema: String,

    /// Staging table
    #[validate(length(min = 1, max = 63))]
    pub staging_table: String,

    /// Statement run after a successful load
    #[serde(default)]
    pub transform_sql: Option<String>,

    /// Enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Job {
    /// Create a builder.
    pub fn builder() -> JobBuilder {
        JobBuilder::default()
    }

    /// Destination for this job's records.
    pub fn staging(&self) -> StagingLocation {
        StagingLocation::new(&self.staging_schema, &self.staging_table)
    }

    /// The transform statement, if one is set and not blank.
    pub fn transform(&self) -> Option<&str> {
        self.transform_sql
            .as_deref()
            .filter(|sql| !sql.trim().is_empty())
    }

    /// Build the first-page URL for this job.
    ///
    /// `$select` and `$filter` are appended only when present.
    pub fn resource_url(&self, base_url: &str) -> Result<Url> {
        let api = Url::parse(&format!("{}/{}", base_url.trim_end_matches('/'), API_PATH))
            .map_err(|e| Error::config(format!("Invalid base URL '{}': {}", base_url, e)))?;

        let mut url = api.join(&self.entity_set).map_err(|e| {
            Error::config(format!("Invalid entity set '{}': {}", self.entity_set, e))
        })?;

        let mut params = Vec::new();
        if let Some(select) = non_blank(&self.select) {
            params.push(format!("$select={}", select));
        }
        if let Some(filter) = non_blank(&self.filter) {
            params.push(format!("$filter={}", filter));
        }
        if !params.is_empty() {
            url.set_query(Some(&params.join("&")));
        }

        Ok(url)
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Builder for Job.
#[derive(Debug, Default)]
pub struct JobBuilder {
    key: Option<String>,
    entity_set: Option<String>,
    select: Option<String>,
    filter: Option<String>,
    staging_schema: Option<String>,
    staging_table: Option<String>,
    transform_sql: Option<String>,
    disabled: bool,
}

impl JobBuilder {
    /// Set the job key.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the entity set name.
    pub fn entity_set(mut self, name: impl Into<String>) -> Self {
        self.entity_set = Some(name.into());
        self
    }

    /// Set the `$select` expression.
    pub fn select(mut self, select: impl Into<String>) -> Self {
        self.select = Some(select.into());
        self
    }

    /// Set the `$filter` expression.
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Set the staging location.
    pub fn staging(mut self, schema: impl Into<String>, table: impl Into<String>) -> Self {
        self.staging_schema = Some(schema.into());
        self.staging_table = Some(table.into());
        self
    }

    /// Set the transform statement.
    pub fn transform_sql(mut self, sql: impl Into<String>) -> Self {
        self.transform_sql = Some(sql.into());
        self
    }

    /// Set enabled flag.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.disabled = !enabled;
        self
    }

    /// Build the Job.
    ///
    /// The entity set defaults to the key and the staging table to
    /// `dv_<key>_raw`.
    pub fn build(self) -> Result<Job> {
        let key = self.key.ok_or_else(|| Error::config("job key required"))?;
        let entity_set = self.entity_set.unwrap_or_else(|| key.clone());
        let staging_table = self
            .staging_table
            .unwrap_or_else(|| format!("dv_{}_raw", key));

        let job = Job {
            key,
            entity_set,
            select: self.select,
            filter: self.filter,
            staging_schema: self.staging_schema.unwrap_or_else(default_staging_schema),
            staging_table,
            transform_sql: self.transform_sql,
            enabled: !self.disabled,
        };

        job.validate()
            .map_err(|e| Error::validation(format!("Job '{}' is invalid: {}", job.key, e)))?;
        Ok(job)
    }
}

/// Reject registries that declare the same key twice.
pub fn check_unique_keys(registry: &[Job]) -> Result<()> {
    let mut seen = HashSet::new();
    for job in registry {
        if !seen.insert(job.key.as_str()) {
            return Err(Error::config(format!("Duplicate table key: {}", job.key)));
        }
    }
    Ok(())
}

/// Resolve the jobs to run.
///
/// With no requested keys every enabled job runs. Otherwise every requested
/// key must exist; the selected jobs still run in registry order.
pub fn select_jobs<'a>(registry: &'a [Job], requested: &[String]) -> Result<Vec<&'a Job>> {
    if requested.is_empty() {
        return Ok(registry.iter().filter(|j| j.enabled).collect());
    }

    let known: HashSet<&str> = registry.iter().map(|j| j.key.as_str()).collect();
    let mut invalid: Vec<String> = Vec::new();
    for key in requested {
        if !known.contains(key.as_str()) && !invalid.contains(key) {
            invalid.push(key.clone());
        }
    }

    if !invalid.is_empty() {
        let valid = registry.iter().map(|j| j.key.clone()).collect();
        return Err(Error::selection(invalid, valid));
    }

    let wanted: HashSet<&str> = requested.iter().map(String::as_str).collect();
    Ok(registry
        .iter()
        .filter(|j| wanted.contains(j.key.as_str()))
        .collect())
}

fn default_staging_schema() -> String {
    DEFAULT_STAGING_SCHEMA.into()
}
fn default_true() -> bool {
    true
}
