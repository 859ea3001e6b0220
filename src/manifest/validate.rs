//! The one manifest validator, used before packing and after parsing.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
};

use serde::Serialize;

use super::Manifest;

/// Lookup of which in-container file names have a byte payload.
pub trait PayloadIndex {
    fn contains_file(&self, file_name: &str) -> bool;
}

impl<V> PayloadIndex for HashMap<String, V> {
    fn contains_file(&self, file_name: &str) -> bool {
        self.contains_key(file_name)
    }
}

impl<V> PayloadIndex for BTreeMap<String, V> {
    fn contains_file(&self, file_name: &str) -> bool {
        self.contains_key(file_name)
    }
}

impl PayloadIndex for HashSet<String> {
    fn contains_file(&self, file_name: &str) -> bool {
        self.contains(file_name)
    }
}

impl PayloadIndex for [String] {
    fn contains_file(&self, file_name: &str) -> bool {
        self.iter().any(|f| f == file_name)
    }
}

/// A violated manifest rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ValidationIssue {
    MissingPrimaryAsset,
    MissingTitle,
    MissingPayload { key: String, file_name: String },
    DanglingDerivedFrom { key: String, derived_from: String },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::MissingPrimaryAsset => {
                f.write_str("archive needs a primary asset (scene, mesh or pointcloud)")
            }
            ValidationIssue::MissingTitle => f.write_str("project title required"),
            ValidationIssue::MissingPayload { key, file_name } => {
                write!(f, "entry `{key}` references missing file `{file_name}`")
            }
            ValidationIssue::DanglingDerivedFrom { key, derived_from } => {
                write!(f, "entry `{key}` is derived from unknown primary `{derived_from}`")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn from_issues(errors: Vec<ValidationIssue>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// Check every rule and report all violations, not just the first.
pub fn validate<P: PayloadIndex + ?Sized>(manifest: &Manifest, payloads: &P) -> ValidationReport {
    let mut errors = Vec::new();

    if manifest.primary_entries().next().is_none() {
        errors.push(ValidationIssue::MissingPrimaryAsset);
    }
    if manifest.project.title.trim().is_empty() {
        errors.push(ValidationIssue::MissingTitle);
    }

    for (key, entry) in &manifest.data_entries {
        if !payloads.contains_file(&entry.file_name) {
            errors.push(ValidationIssue::MissingPayload {
                key: key.clone(),
                file_name: entry.file_name.clone(),
            });
        }
        if let Some(parent) = &entry.derived_from {
            let ok = manifest
                .data_entries
                .get(parent)
                .is_some_and(|p| p.role.is_primary_asset());
            if !ok {
                errors.push(ValidationIssue::DanglingDerivedFrom {
                    key: key.clone(),
                    derived_from: parent.clone(),
                });
            }
        }
    }

    ValidationReport::from_issues(errors)
}
