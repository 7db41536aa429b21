// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Input model domain types.
//!
//! An input model is a set of named sections spread across many YAML files.
//! [`FileInfo`] records exactly which file contributed which slice of which
//! section, so a model read into memory can be written back to the same file
//! layout the operator authored.

use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use thiserror::Error;

/// Primary descriptor file of every input model.
pub const CLOUD_CONFIG: &str = "cloudConfig.yml";

/// The only object section that may legally be spread over multiple files.
pub const PASS_THROUGH: &str = "pass-through";

/// Section present in every model file, never treated as model data.
pub const PRODUCT: &str = "product";

/// Candidate key fields for list records, in precedence order.
pub const ID_KEYS: [&str; 4] = ["name", "id", "region-name", "node_name"];

/// Returns the key field identifying `record`, per the precedence rule.
pub fn id_key(record: &Value) -> Option<&'static str> {
    let map = record.as_mapping()?;
    ID_KEYS
        .iter()
        .copied()
        .find(|key| map.get(&Value::String((*key).to_string())).is_some())
}

/// The in-memory model: an order-preserving map of section name to section
/// data (a YAML list of records or a nested object).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputModel {
    pub sections: IndexMap<String, Value>,
}

impl InputModel {
    pub fn get(&self, section: &str) -> Option<&Value> {
        self.sections.get(section)
    }

    pub fn get_mut(&mut self, section: &str) -> Option<&mut Value> {
        self.sections.get_mut(section)
    }

    pub fn insert(&mut self, section: impl Into<String>, value: Value) {
        self.sections.insert(section.into(), value);
    }

    pub fn remove(&mut self, section: &str) -> Option<Value> {
        self.sections.shift_remove(section)
    }

    pub fn contains(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }
}

/// What one file contributed to one section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SectionDescriptor {
    /// The file holds the entire section.
    Whole { section: String },
    /// The file holds the list records whose `key_field` value is in `keys`.
    List {
        section: String,
        key_field: String,
        keys: Vec<Value>,
    },
    /// The file holds the listed property paths (dotted, at most two levels)
    /// of an object section.
    Object { section: String, paths: Vec<String> },
}

impl SectionDescriptor {
    pub fn section(&self) -> &str {
        match self {
            Self::Whole { section }
            | Self::List { section, .. }
            | Self::Object { section, .. } => section,
        }
    }
}

/// Provenance captured while reading a model, consulted when writing it back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Directory the model was read from.
    pub directory: PathBuf,
    /// Path of the primary descriptor file.
    pub config_file: PathBuf,
    /// Every model file, relative to `directory`.
    pub files: Vec<String>,
    /// Section name to the files owning (part of) it.
    pub sections: IndexMap<String, Vec<String>>,
    /// File to the ordered descriptors of its contents.
    pub file_section_map: IndexMap<String, Vec<SectionDescriptor>>,
    /// Newest mtime over all model files, epoch millis.
    pub mtime: i64,
}

impl FileInfo {
    /// True when every file owning `section` holds exactly one record, i.e.
    /// the section is maintained one-record-per-file.
    pub fn is_split_per_record(&self, section: &str) -> bool {
        let Some(owners) = self.sections.get(section) else {
            return false;
        };
        if owners.len() < 2 {
            return false;
        }
        let single_key_files = self
            .file_section_map
            .values()
            .flatten()
            .filter(|d| {
                matches!(d, SectionDescriptor::List { section: s, keys, .. }
                    if s == section && keys.len() == 1)
            })
            .count();
        single_key_files == owners.len()
    }

    /// Key field recorded for a list section, if any file recorded one.
    pub fn key_field_for(&self, section: &str) -> Option<&str> {
        self.file_section_map.values().flatten().find_map(|d| match d {
            SectionDescriptor::List {
                section: s,
                key_field,
                ..
            } if s == section => Some(key_field.as_str()),
            _ => None,
        })
    }
}

/// A fully read model: data, provenance and collected per-file read errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDocument {
    pub name: String,
    pub version: u64,
    /// README files found in the model tree, keyed by extension.
    pub readme: IndexMap<String, String>,
    pub input_model: InputModel,
    pub file_info: FileInfo,
    /// Non-fatal per-file errors collected during the read.
    pub errors: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unexpected input model schema version, expected {expected}")]
    Version { expected: u64 },

    #[error("no cloud name specified in {CLOUD_CONFIG}")]
    MissingCloudName,

    #[error("object section '{section}' is spread over multiple files: {files:?}")]
    SplitObjectSection { section: String, files: Vec<String> },

    #[error("input model contains errors: {0:?}")]
    InvalidModel(Vec<String>),

    #[error("unable to determine the key field for section '{0}'")]
    UnresolvableSection(String),

    #[error("concurrent writes to the model are not allowed")]
    ConcurrentWrite,

    #[error("checked out commit does not match the head of branch '{0}'")]
    NotBranchHead(String),

    #[error("there are no changes to commit")]
    NoChanges,

    #[error("{0}")]
    User(String),

    #[error("model storage error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("model YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("version control error: {0}")]
    Git(#[from] git2::Error),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
