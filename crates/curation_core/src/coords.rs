//! Warehouse coordinates a pipeline run is bound to.

use crate::error::{CoreError, CoreResult};
use crate::stage::DataStage;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Project ids allow dashes and dots (domain-scoped projects).
static PROJECT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9.:\-]*$").expect("static pattern"));

/// Dataset and table names are plain identifiers.
static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static pattern"));

fn check(pattern: &Regex, kind: &str, value: &str) -> CoreResult<()> {
    if pattern.is_match(value) {
        Ok(())
    } else {
        Err(CoreError::InvalidId {
            kind: kind.to_string(),
            reason: format!("'{}' is not a valid {}", value, kind),
        })
    }
}

/// The project/dataset/sandbox triple a run operates on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinates {
    /// Warehouse project
    pub project: String,
    /// Dataset being cleaned
    pub dataset: String,
    /// Dataset receiving sandbox (audit) tables
    pub sandbox_dataset: String,
    /// Pipeline stage of `dataset`, if known
    pub stage: Option<DataStage>,
}

impl Coordinates {
    /// Create validated coordinates
    ///
    /// # Errors
    ///
    /// Returns error if a name is malformed or the sandbox dataset is the
    /// dataset being cleaned
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        sandbox_dataset: impl Into<String>,
    ) -> CoreResult<Self> {
        let coords = Self {
            project: project.into(),
            dataset: dataset.into(),
            sandbox_dataset: sandbox_dataset.into(),
            stage: None,
        };
        coords.validate()?;
        Ok(coords)
    }

    /// Set the data stage
    #[must_use]
    pub fn with_stage(mut self, stage: DataStage) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Validate names and the dataset/sandbox separation
    ///
    /// # Errors
    ///
    /// Returns error if any name is malformed or datasets collide
    pub fn validate(&self) -> CoreResult<()> {
        check(&PROJECT_PATTERN, "project", &self.project)?;
        check(&NAME_PATTERN, "dataset", &self.dataset)?;
        check(&NAME_PATTERN, "sandbox dataset", &self.sandbox_dataset)?;
        if self.dataset == self.sandbox_dataset {
            return Err(CoreError::Validation {
                field: "sandbox_dataset".to_string(),
                reason: format!(
                    "sandbox dataset must differ from the dataset being cleaned ({})",
                    self.dataset
                ),
            });
        }
        Ok(())
    }

    /// Reference to a table in the dataset being cleaned
    #[must_use]
    pub fn dataset_table(&self, table: &str) -> TableRef {
        TableRef::new(&self.project, &self.dataset, table)
    }

    /// Reference to a table in the sandbox dataset
    #[must_use]
    pub fn sandbox_table(&self, table: &str) -> TableRef {
        TableRef::new(&self.project, &self.sandbox_dataset, table)
    }
}

/// Fully qualified table reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    /// Warehouse project
    pub project: String,
    /// Dataset
    pub dataset: String,
    /// Table name
    pub table: String,
}

impl TableRef {
    /// Create a table reference
    #[must_use]
    pub fn new(project: &str, dataset: &str, table: &str) -> Self {
        Self {
            project: project.to_string(),
            dataset: dataset.to_string(),
            table: table.to_string(),
        }
    }

    /// Parse `project.dataset.table`
    ///
    /// # Errors
    ///
    /// Returns error if the reference does not have three valid parts
    pub fn parse(s: &str) -> CoreResult<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        // Domain-scoped projects contain dots, so the last two parts are
        // dataset and table and everything before is the project.
        if parts.len() < 3 {
            return Err(CoreError::InvalidId {
                kind: "table reference".to_string(),
                reason: format!("'{}' is not of the form project.dataset.table", s),
            });
        }
        let table = parts[parts.len() - 1];
        let dataset = parts[parts.len() - 2];
        let project = parts[..parts.len() - 2].join(".");
        check(&PROJECT_PATTERN, "project", &project)?;
        check(&NAME_PATTERN, "dataset", dataset)?;
        check(&NAME_PATTERN, "table", table)?;
        Ok(Self::new(&project, dataset, table))
    }

    /// Whether this table lives in the given dataset of the given project
    #[must_use]
    pub fn is_in(&self, project: &str, dataset: &str) -> bool {
        self.project == project && self.dataset == dataset
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}
