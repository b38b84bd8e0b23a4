//! Declarative SQL rules and the catalog file format.
//!
//! A catalog file is TOML with one `[[rule]]` table per rule:
//!
//! ```toml
//! [[rule]]
//! id = "remove_invalid_obs"
//! identifiers = ["DC-812"]
//! description = "Remove observations with no concept"
//! stages = ["combined"]
//! affected_tables = ["observation"]
//! depends_on = []
//!
//! [[rule.query]]
//! text = "SELECT * FROM `{project}.{dataset}.observation` WHERE observation_concept_id = 0"
//! destination = "sandbox:observation"
//!
//! [[rule.query]]
//! text = "DELETE FROM `{project}.{dataset}.observation` WHERE observation_concept_id = 0"
//! mutates = "observation"
//! ```
//!
//! Statement text may use `{project}`, `{dataset}`, `{sandbox_dataset}` and
//! `{sandbox_table:<table>}`. A destination is `sandbox:<table>`,
//! `dataset:<table>`, or a qualified `project.dataset.table`.

use crate::catalog::{CatalogError, RuleCatalog};
use crate::rule::{CleaningRule, RuleContext, RuleError, Validation};
use async_trait::async_trait;
use curation_core::{Coordinates, DataStage, RuleId, TableRef};
use curation_plan::{QuerySpec, RuleDescriptor, SandboxNames, WriteMode};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::path::Path;

static SANDBOX_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{sandbox_table:([A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern")
});

fn default_blocking() -> bool {
    true
}

/// One statement of a SQL rule, before placeholder substitution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryTemplate {
    /// Statement text with placeholders
    pub text: String,
    /// Destination with placeholders or a `sandbox:`/`dataset:` prefix
    #[serde(default)]
    pub destination: Option<String>,
    /// How the destination is populated
    #[serde(default)]
    pub write_mode: WriteMode,
    /// Whether later statements wait for this one
    #[serde(default = "default_blocking")]
    pub blocking: bool,
    /// Table mutated in place by a DELETE/UPDATE
    #[serde(default)]
    pub mutates: Option<String>,
}

impl QueryTemplate {
    /// A blocking statement with no destination
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            destination: None,
            write_mode: WriteMode::default(),
            blocking: true,
            mutates: None,
        }
    }

    /// Write the result to `destination`
    #[must_use]
    pub fn to(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Set the write mode
    #[must_use]
    pub fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    /// Set whether later statements wait for this one
    #[must_use]
    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// Declare an in-place mutation of `table`
    #[must_use]
    pub fn mutating(mut self, table: impl Into<String>) -> Self {
        self.mutates = Some(table.into());
        self
    }
}

/// A rule whose statements are templates
#[derive(Debug, Clone)]
pub struct SqlRule {
    descriptor: RuleDescriptor,
    sandbox_overrides: IndexMap<String, String>,
    setup: Vec<QueryTemplate>,
    queries: Vec<QueryTemplate>,
    validation: Vec<QueryTemplate>,
}

impl SqlRule {
    /// A rule with no statements
    #[must_use]
    pub fn new(descriptor: RuleDescriptor) -> Self {
        Self {
            descriptor,
            sandbox_overrides: IndexMap::new(),
            setup: Vec::new(),
            queries: Vec::new(),
            validation: Vec::new(),
        }
    }

    /// Add a setup statement
    #[must_use]
    pub fn with_setup(mut self, template: QueryTemplate) -> Self {
        self.setup.push(template);
        self
    }

    /// Add a cleaning statement
    #[must_use]
    pub fn with_query(mut self, template: QueryTemplate) -> Self {
        self.queries.push(template);
        self
    }

    /// Add a validation statement
    #[must_use]
    pub fn with_validation(mut self, template: QueryTemplate) -> Self {
        self.validation.push(template);
        self
    }

    /// Use `name` as the sandbox table for `table`
    #[must_use]
    pub fn with_sandbox_name(mut self, table: impl Into<String>, name: impl Into<String>) -> Self {
        self.sandbox_overrides.insert(table.into(), name.into());
        self
    }

    fn render_text(&self, text: &str, coords: &Coordinates) -> Result<String, RuleError> {
        let names = self.sandbox_names();
        let rendered = SANDBOX_PLACEHOLDER
            .replace_all(text, |caps: &Captures<'_>| names.name_for(&caps[1]))
            .replace("{project}", &coords.project)
            .replace("{dataset}", &coords.dataset)
            .replace("{sandbox_dataset}", &coords.sandbox_dataset);
        if rendered.contains("{sandbox_table:") {
            return Err(RuleError::message(format!(
                "malformed sandbox_table placeholder in: {text}"
            )));
        }
        Ok(rendered)
    }

    fn render_destination(&self, dest: &str, coords: &Coordinates) -> Result<TableRef, RuleError> {
        if let Some(table) = dest.strip_prefix("sandbox:") {
            return Ok(coords.sandbox_table(&self.sandbox_names().name_for(table)));
        }
        if let Some(table) = dest.strip_prefix("dataset:") {
            return Ok(coords.dataset_table(table));
        }
        let rendered = self.render_text(dest, coords)?;
        TableRef::parse(&rendered)
            .map_err(|e| RuleError::message(format!("bad destination '{dest}': {e}")))
    }

    fn render(&self, template: &QueryTemplate, coords: &Coordinates) -> Result<QuerySpec, RuleError> {
        let destination = template
            .destination
            .as_deref()
            .map(|d| self.render_destination(d, coords))
            .transpose()?;
        Ok(QuerySpec {
            text: self.render_text(&template.text, coords)?,
            destination,
            write_mode: template.write_mode,
            is_blocking: template.blocking,
            mutates: template.mutates.clone(),
        })
    }

    fn render_all(
        &self,
        templates: &[QueryTemplate],
        coords: &Coordinates,
    ) -> Result<Vec<QuerySpec>, RuleError> {
        templates.iter().map(|t| self.render(t, coords)).collect()
    }
}

#[async_trait]
impl CleaningRule for SqlRule {
    fn descriptor(&self) -> &RuleDescriptor {
        &self.descriptor
    }

    async fn setup(&self, ctx: &RuleContext<'_>) -> Result<(), RuleError> {
        if self.setup.is_empty() {
            return Ok(());
        }
        let statements = self.render_all(&self.setup, ctx.coordinates)?;
        ctx.run_checked(&statements).await
    }

    fn query_specs(&self, coords: &Coordinates) -> Result<Vec<QuerySpec>, RuleError> {
        self.render_all(&self.queries, coords)
    }

    async fn validate(&self, ctx: &RuleContext<'_>) -> Result<Validation, RuleError> {
        if self.validation.is_empty() {
            return Ok(Validation::NotImplemented);
        }
        let statements = self.render_all(&self.validation, ctx.coordinates)?;
        match ctx.run_checked(&statements).await {
            Ok(()) => Ok(Validation::Passed),
            Err(err @ RuleError::Statement { .. }) => Ok(Validation::Failed {
                reason: err.to_string(),
            }),
            Err(err) => Err(err),
        }
    }

    fn sandbox_names(&self) -> SandboxNames {
        self.sandbox_overrides.iter().fold(
            SandboxNames::derived(self.descriptor.id.clone()),
            |names, (table, name)| names.with_override(table.clone(), name.clone()),
        )
    }
}

/// One `[[rule]]` table of a catalog file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleEntry {
    /// Rule id
    pub id: String,
    /// Issue/ticket tags
    #[serde(default)]
    pub identifiers: Vec<String>,
    /// Human description
    #[serde(default)]
    pub description: String,
    /// Stages the rule applies to, empty for all
    #[serde(default)]
    pub stages: Vec<DataStage>,
    /// Tables the rule touches, empty for dataset-wide rules
    #[serde(default)]
    pub affected_tables: Vec<String>,
    /// Rules that must run first
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Sandbox table name overrides, by affected table
    #[serde(default)]
    pub sandbox_tables: IndexMap<String, String>,
    /// Setup statements
    #[serde(default)]
    pub setup: Vec<QueryTemplate>,
    /// Cleaning statements
    #[serde(default, rename = "query")]
    pub queries: Vec<QueryTemplate>,
    /// Validation statements
    #[serde(default)]
    pub validation: Vec<QueryTemplate>,
}

impl RuleEntry {
    /// Build the rule
    ///
    /// # Errors
    ///
    /// Returns error if an id is malformed or a destination prefix names no
    /// table
    pub fn into_rule(self) -> Result<SqlRule, CatalogError> {
        let invalid = |reason: String| CatalogError::InvalidRule {
            rule: self.id.clone(),
            reason,
        };

        let id = RuleId::new(self.id.as_str()).map_err(|e| invalid(e.to_string()))?;
        let mut descriptor = RuleDescriptor::new(id, self.description.clone());
        for tag in &self.identifiers {
            descriptor = descriptor.with_identifier(tag.clone());
        }
        for stage in &self.stages {
            descriptor = descriptor.with_stage(*stage);
        }
        for table in &self.affected_tables {
            descriptor = descriptor.with_affected_table(table.clone());
        }
        for dep in &self.depends_on {
            let dep = RuleId::new(dep.as_str())
                .map_err(|e| invalid(format!("depends_on '{dep}': {e}")))?;
            descriptor = descriptor.with_dependency(dep);
        }

        for template in self.setup.iter().chain(&self.queries).chain(&self.validation) {
            if let Some(dest) = &template.destination {
                let bare = dest
                    .strip_prefix("sandbox:")
                    .or_else(|| dest.strip_prefix("dataset:"));
                if bare.is_some_and(str::is_empty) {
                    return Err(invalid(format!("destination '{dest}' names no table")));
                }
            }
        }

        let mut rule = SqlRule::new(descriptor);
        rule.sandbox_overrides = self.sandbox_tables;
        rule.setup = self.setup;
        rule.queries = self.queries;
        rule.validation = self.validation;
        Ok(rule)
    }
}

/// Parsed catalog file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogFile {
    /// Rules in file order
    #[serde(default, rename = "rule")]
    pub rules: Vec<RuleEntry>,
}

impl CatalogFile {
    /// Parse from TOML text
    ///
    /// # Errors
    ///
    /// Returns error if the text is not a valid catalog
    pub fn from_toml_str(text: &str) -> Result<Self, CatalogError> {
        Self::parse_named(text, "<inline>")
    }

    /// Load from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| CatalogError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::parse_named(&text, &path.display().to_string())
    }

    fn parse_named(text: &str, name: &str) -> Result<Self, CatalogError> {
        toml::from_str(text).map_err(|e| CatalogError::Parse {
            path: name.to_string(),
            message: e.to_string(),
        })
    }

    /// Build an immutable catalog in file order
    ///
    /// # Errors
    ///
    /// Returns error if an entry is invalid, an id repeats, or a dependency
    /// is missing
    pub fn into_catalog(self) -> Result<RuleCatalog, CatalogError> {
        self.rules
            .into_iter()
            .try_fold(RuleCatalog::builder(), |builder, entry| {
                builder.register(entry.into_rule()?)
            })?
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CATALOG: &str = r#"
        [[rule]]
        id = "Remove_Invalid_Obs"
        identifiers = ["DC-812"]
        description = "Remove observations with no concept"
        stages = ["combined", "unioned"]
        affected_tables = ["observation"]

        [[rule.query]]
        text = "SELECT * FROM `{project}.{dataset}.observation` WHERE c = 0"
        destination = "sandbox:observation"

        [[rule.query]]
        text = "DELETE FROM `{project}.{dataset}.observation` WHERE c = 0"
        mutates = "observation"

        [[rule]]
        id = "dedupe_person"
        affected_tables = ["person"]
        depends_on = ["Remove_Invalid_Obs"]

        [rule.sandbox_tables]
        person = "person_dupes"

        [[rule.setup]]
        text = "CREATE TABLE IF NOT EXISTS `{project}.{sandbox_dataset}.lookup` AS SELECT 1"

        [[rule.query]]
        text = "SELECT * FROM `{project}.{dataset}.person` p JOIN `{project}.{sandbox_dataset}.{sandbox_table:person}` d USING (person_id)"
        destination = "{project}.{sandbox_dataset}.report"
        write_mode = "append"
        blocking = false

        [[rule.validation]]
        text = "SELECT ERROR('duplicates remain') FROM `{project}.{dataset}.person` LIMIT 0"
    "#;

    fn coords() -> Coordinates {
        Coordinates::new("proj", "combined", "combined_sandbox").unwrap()
    }

    #[test]
    fn test_parse_catalog() {
        let file = CatalogFile::from_toml_str(CATALOG).unwrap();
        assert_eq!(file.rules.len(), 2);
        assert_eq!(file.rules[0].queries.len(), 2);
        assert!(file.rules[0].queries[0].blocking);
        assert_eq!(file.rules[1].queries[0].write_mode, WriteMode::Append);

        let catalog = file.into_catalog().unwrap();
        let ids: Vec<_> = catalog.ids().map(RuleId::as_str).collect();
        assert_eq!(ids, vec!["Remove_Invalid_Obs", "dedupe_person"]);
    }

    #[test]
    fn test_render_placeholders() {
        let rule = CatalogFile::from_toml_str(CATALOG)
            .unwrap()
            .rules
            .remove(0)
            .into_rule()
            .unwrap();
        let specs = rule.query_specs(&coords()).unwrap();

        assert_eq!(
            specs[0].text,
            "SELECT * FROM `proj.combined.observation` WHERE c = 0"
        );
        assert_eq!(
            specs[0].destination.as_ref().map(ToString::to_string).as_deref(),
            Some("proj.combined_sandbox.remove_invalid_obs_observation")
        );
        assert_eq!(specs[1].mutates.as_deref(), Some("observation"));
        assert_eq!(specs[1].destroys(&coords()), Some("observation"));
    }

    #[test]
    fn test_sandbox_override_and_qualified_destination() {
        let rule = CatalogFile::from_toml_str(CATALOG)
            .unwrap()
            .rules
            .remove(1)
            .into_rule()
            .unwrap();
        let specs = rule.query_specs(&coords()).unwrap();

        assert!(specs[0].text.contains("`proj.combined_sandbox.person_dupes`"));
        assert_eq!(
            specs[0].destination,
            Some(TableRef::new("proj", "combined_sandbox", "report"))
        );
        assert!(!specs[0].is_blocking);
    }

    #[test]
    fn test_malformed_placeholder() {
        let rule = SqlRule::new(RuleDescriptor::new(RuleId::new("r").unwrap(), ""))
            .with_query(QueryTemplate::new("SELECT * FROM {sandbox_table:bad-name}"));
        assert!(rule.query_specs(&coords()).is_err());
    }

    #[test]
    fn test_invalid_entries() {
        let bad_id = CatalogFile::from_toml_str("[[rule]]\nid = \"9lives\"").unwrap();
        assert!(matches!(
            bad_id.into_catalog().unwrap_err(),
            CatalogError::InvalidRule { .. }
        ));

        let empty_dest = CatalogFile::from_toml_str(
            "[[rule]]\nid = \"r\"\n[[rule.query]]\ntext = \"x\"\ndestination = \"sandbox:\"",
        )
        .unwrap();
        assert!(empty_dest.into_catalog().is_err());

        let missing_dep =
            CatalogFile::from_toml_str("[[rule]]\nid = \"r\"\ndepends_on = [\"ghost\"]").unwrap();
        assert!(matches!(
            missing_dep.into_catalog().unwrap_err(),
            CatalogError::UnknownDependency { .. }
        ));

        assert!(matches!(
            CatalogFile::from_toml_str("[[rule]]\nid = \"r\"\nbogus = 1").unwrap_err(),
            CatalogError::Parse { .. }
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CATALOG.as_bytes()).unwrap();
        let catalog = CatalogFile::load(file.path()).unwrap().into_catalog().unwrap();
        assert_eq!(catalog.len(), 2);
    }
}
