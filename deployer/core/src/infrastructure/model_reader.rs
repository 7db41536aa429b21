// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Reads an input model from a directory tree of YAML files.
//!
//! The read starts at the primary descriptor file (`cloudConfig.yml`) and then
//! visits every other `*.yml` file in the tree. List sections concatenate
//! across files, object sections deep-merge. While merging, a
//! [`SectionDescriptor`] is recorded per file and section so the writer can
//! later reproduce the exact file layout.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_yaml::Value;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::domain::model::{
    id_key, FileInfo, InputModel, ModelDocument, ModelError, SectionDescriptor, CLOUD_CONFIG,
    PASS_THROUGH, PRODUCT,
};

/// Reads the model under `dir`. Fails on a missing or malformed descriptor
/// file, a schema version other than `expected_version`, or a non
/// pass-through object section spread over several files. Per-file load
/// failures are collected into the returned document instead.
pub fn read_model(dir: &Path, expected_version: u64) -> Result<ModelDocument, ModelError> {
    let config_file = dir.join(CLOUD_CONFIG);
    let raw = fs::read_to_string(&config_file).map_err(|source| ModelError::Io {
        path: config_file.clone(),
        source,
    })?;
    let descriptor: Value = serde_yaml::from_str(&raw)?;

    let version = descriptor
        .get(PRODUCT)
        .and_then(|p| p.get("version"))
        .and_then(Value::as_u64);
    if version != Some(expected_version) {
        return Err(ModelError::Version {
            expected: expected_version,
        });
    }

    let name = descriptor
        .get("cloud")
        .and_then(|cloud| cloud.get("name"))
        .and_then(Value::as_str)
        .ok_or(ModelError::MissingCloudName)?
        .to_string();

    debug!(cloud = %name, directory = %dir.display(), "Reading input model");

    let mut reader = ModelReader {
        dir: dir.to_path_buf(),
        doc: ModelDocument {
            name,
            version: expected_version,
            readme: IndexMap::new(),
            input_model: InputModel::default(),
            file_info: FileInfo {
                directory: dir.to_path_buf(),
                config_file,
                ..FileInfo::default()
            },
            errors: Vec::new(),
        },
        object_data: IndexMap::new(),
    };

    reader.merge_sections(&descriptor);
    reader.register_file(&reader.doc.file_info.config_file.clone(), &descriptor)?;
    reader.read_tree()?;
    reader.track_object_sections()?;

    Ok(reader.doc)
}

struct ModelReader {
    dir: PathBuf,
    doc: ModelDocument,
    /// Object section contributions: section name to (file, data) pairs,
    /// resolved into descriptors once the whole tree has been read.
    object_data: IndexMap<String, Vec<(String, Value)>>,
}

impl ModelReader {
    fn read_tree(&mut self) -> Result<(), ModelError> {
        for entry in WalkDir::new(&self.dir).sort_by_file_name() {
            let entry = entry.map_err(|e| ModelError::Io {
                path: self.dir.clone(),
                source: e
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::other("directory walk failed")),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name == CLOUD_CONFIG {
                continue;
            }
            if file_name.starts_with("README") {
                self.read_readme(entry.path());
                continue;
            }
            if entry.path().extension().and_then(|e| e.to_str()) != Some("yml") {
                continue;
            }
            if let Err(error) = self.read_model_file(entry.path()) {
                warn!(file = %entry.path().display(), %error, "Failed to load model file");
                self.doc
                    .errors
                    .push(format!("Failed to load {}: {}", entry.path().display(), error));
            }
        }
        Ok(())
    }

    fn read_model_file(&mut self, path: &Path) -> Result<(), ModelError> {
        let raw = fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed: Value = serde_yaml::from_str(&raw)?;
        self.merge_sections(&parsed);
        self.register_file(path, &parsed)
    }

    /// Merges the sections of one file into the in-memory model: lists
    /// concatenate, objects merge recursively, scalars overwrite.
    fn merge_sections(&mut self, parsed: &Value) {
        let Some(map) = parsed.as_mapping() else {
            return;
        };
        for (key, value) in map {
            let Some(section) = key.as_str() else {
                continue;
            };
            match value {
                Value::Sequence(records) => {
                    if let Some(Value::Sequence(existing)) =
                        self.doc.input_model.get_mut(section)
                    {
                        existing.extend(records.iter().cloned());
                    } else {
                        self.doc.input_model.insert(section, value.clone());
                    }
                }
                Value::Mapping(_) => {
                    if let Some(existing) = self.doc.input_model.get_mut(section) {
                        deep_merge(existing, value);
                    } else {
                        self.doc.input_model.insert(section, value.clone());
                    }
                }
                _ => self.doc.input_model.insert(section, value.clone()),
            }
        }
    }

    /// Records provenance for one file: which sections it holds, and for list
    /// sections, which records (by key). Object sections are resolved later.
    fn register_file(&mut self, path: &Path, parsed: &Value) -> Result<(), ModelError> {
        let rel = path
            .strip_prefix(&self.dir)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned();

        let metadata = fs::metadata(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if let Ok(modified) = metadata.modified() {
            let mtime = DateTime::<Utc>::from(modified).timestamp_millis();
            self.doc.file_info.mtime = self.doc.file_info.mtime.max(mtime);
        }

        self.doc.file_info.files.push(rel.clone());

        let mut descriptors = Vec::new();
        if let Some(map) = parsed.as_mapping() {
            for (key, value) in map {
                let Some(section) = key.as_str() else {
                    continue;
                };
                self.doc
                    .file_info
                    .sections
                    .entry(section.to_string())
                    .or_default()
                    .push(rel.clone());

                match value {
                    Value::Sequence(records) if !records.is_empty() => {
                        match records.first().and_then(id_key) {
                            Some(key_field) => descriptors.push(SectionDescriptor::List {
                                section: section.to_string(),
                                key_field: key_field.to_string(),
                                keys: records
                                    .iter()
                                    .filter_map(|r| r.get(key_field).cloned())
                                    .collect(),
                            }),
                            // Lists of scalars have no key field; the file
                            // owns the whole section.
                            None => descriptors.push(SectionDescriptor::Whole {
                                section: section.to_string(),
                            }),
                        }
                    }
                    Value::Mapping(_) if section != PRODUCT => {
                        self.object_data
                            .entry(section.to_string())
                            .or_default()
                            .push((rel.clone(), value.clone()));
                    }
                    _ => descriptors.push(SectionDescriptor::Whole {
                        section: section.to_string(),
                    }),
                }
            }
        }
        self.doc.file_info.file_section_map.insert(rel, descriptors);
        Ok(())
    }

    /// Resolves object section contributions into descriptors. A section in a
    /// single file is owned whole; only `pass-through` may span files, in
    /// which case each file is recorded by the property paths it contributed.
    fn track_object_sections(&mut self) -> Result<(), ModelError> {
        for (section, entries) in &self.object_data {
            if entries.len() > 1 && section != PASS_THROUGH {
                return Err(ModelError::SplitObjectSection {
                    section: section.clone(),
                    files: entries.iter().map(|(file, _)| file.clone()).collect(),
                });
            }
            for (file, data) in entries {
                let descriptor = if entries.len() == 1 {
                    SectionDescriptor::Whole {
                        section: section.clone(),
                    }
                } else {
                    SectionDescriptor::Object {
                        section: section.clone(),
                        paths: property_paths(data),
                    }
                };
                if let Some(descriptors) = self.doc.file_info.file_section_map.get_mut(file) {
                    descriptors.push(descriptor);
                }
            }
        }
        Ok(())
    }

    fn read_readme(&mut self, path: &Path) {
        let key = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_string();
        match fs::read_to_string(path) {
            Ok(contents) => {
                self.doc.readme.insert(key, contents);
            }
            Err(error) => warn!(file = %path.display(), %error, "Failed to read README"),
        }
    }
}

/// Recursive merge of `src` into `dst`: mapping keys merge, everything else
/// overwrites.
fn deep_merge(dst: &mut Value, src: &Value) {
    match (dst, src) {
        (Value::Mapping(dst_map), Value::Mapping(src_map)) => {
            for (key, value) in src_map {
                match dst_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        dst_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (dst, src) => *dst = src.clone(),
    }
}

/// Dotted property paths of an object, at most two levels deep.
fn property_paths(value: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    collect_paths(value, None, false, &mut paths);
    paths
}

fn collect_paths(value: &Value, prefix: Option<&str>, leaf: bool, out: &mut Vec<String>) {
    let Some(map) = value.as_mapping() else {
        return;
    };
    for (key, child) in map {
        let Some(name) = key.as_str() else {
            continue;
        };
        let path = match prefix {
            Some(p) => format!("{p}.{name}"),
            None => name.to_string(),
        };
        if child.is_mapping() && !leaf {
            collect_paths(child, Some(&path), true, out);
        } else {
            out.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn deep_merge_merges_nested_mappings() {
        let mut dst = yaml("global:\n  install-env: legacy\nother: 1");
        let src = yaml("global:\n  esx_cloud: true");
        deep_merge(&mut dst, &src);
        assert_eq!(
            dst,
            yaml("global:\n  install-env: legacy\n  esx_cloud: true\nother: 1")
        );
    }

    #[test]
    fn property_paths_stop_at_two_levels() {
        let value = yaml("global:\n  nested:\n    too: deep\nflat: 1");
        let mut paths = property_paths(&value);
        paths.sort();
        assert_eq!(paths, vec!["flat".to_string(), "global.nested".to_string()]);
    }
}
