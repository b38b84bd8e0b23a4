//! Generated statements and their execution metadata.

use curation_core::{Coordinates, TableRef};
use serde::{Deserialize, Serialize};

/// How a statement's output populates its destination table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Add rows to the destination
    Append,
    /// Replace the destination's contents
    #[default]
    Truncate,
    /// Write only if the destination is empty or absent
    EmptyOnly,
}

impl WriteMode {
    /// Warehouse spelling of the write disposition
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Append => "WRITE_APPEND",
            Self::Truncate => "WRITE_TRUNCATE",
            Self::EmptyOnly => "WRITE_EMPTY",
        }
    }
}

impl std::fmt::Display for WriteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One generated statement
///
/// The engine never parses `text`. Everything it needs to know about the
/// statement's effect is declared in the other fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySpec {
    /// Statement text
    pub text: String,
    /// Output relation, if the statement has one
    pub destination: Option<TableRef>,
    /// How `destination` is populated
    pub write_mode: WriteMode,
    /// Whether the next statement of the rule must wait for this one
    pub is_blocking: bool,
    /// Table a DELETE/UPDATE mutates in place, if any
    pub mutates: Option<String>,
}

impl QuerySpec {
    /// A statement with no destination
    #[must_use]
    pub fn statement(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            destination: None,
            write_mode: WriteMode::default(),
            is_blocking: true,
            mutates: None,
        }
    }

    /// A statement whose result is written to `destination`
    #[must_use]
    pub fn to_table(text: impl Into<String>, destination: TableRef, write_mode: WriteMode) -> Self {
        Self {
            text: text.into(),
            destination: Some(destination),
            write_mode,
            is_blocking: true,
            mutates: None,
        }
    }

    /// An in-place DELETE or UPDATE of `table`
    #[must_use]
    pub fn mutation(text: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            destination: None,
            write_mode: WriteMode::default(),
            is_blocking: true,
            mutates: Some(table.into()),
        }
    }

    /// Set whether later statements must wait for this one
    #[must_use]
    pub fn blocking(mut self, is_blocking: bool) -> Self {
        self.is_blocking = is_blocking;
        self
    }

    /// The cleaned-dataset table this statement destroys rows of, if any
    ///
    /// In-place mutations are destructive; so is a TRUNCATE write to any
    /// table outside the sandbox dataset.
    #[must_use]
    pub fn destroys(&self, coords: &Coordinates) -> Option<&str> {
        if let Some(table) = &self.mutates {
            return Some(table);
        }
        match &self.destination {
            Some(dest)
                if self.write_mode == WriteMode::Truncate
                    && !dest.is_in(&coords.project, &coords.sandbox_dataset) =>
            {
                Some(&dest.table)
            }
            _ => None,
        }
    }

    /// The sandbox table this statement writes, if any
    #[must_use]
    pub fn sandbox_destination(&self, coords: &Coordinates) -> Option<&str> {
        match &self.destination {
            Some(dest) if dest.is_in(&coords.project, &coords.sandbox_dataset) => Some(&dest.table),
            _ => None,
        }
    }
}
