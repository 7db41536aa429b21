// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Writes an input model back to its directory, reproducing the file layout
//! recorded in [`FileInfo`].
//!
//! The target directory is wiped of YAML files first, each known file is
//! rebuilt from its descriptors, and whatever data no descriptor claims is
//! written to new files under `data/`. Any failure aborts the whole write.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use tracing::{debug, info};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::domain::model::{
    FileInfo, InputModel, ModelDocument, ModelError, SectionDescriptor, PASS_THROUGH, PRODUCT,
};

/// Directory (relative to the model root) where new files are created.
const NEW_MODEL_DIR: &str = "data";

/// Writes `doc` under `target_dir`.
pub fn write_model(doc: &ModelDocument, target_dir: &Path) -> Result<(), ModelError> {
    info!(directory = %target_dir.display(), "Writing input model");
    let mut model = doc.input_model.clone();
    let info = &doc.file_info;

    clear_model_files(target_dir)?;

    for (file, descriptors) in &info.file_section_map {
        let content = reconstruct_file(descriptors, info, &mut model);
        if is_meaningful(&content) {
            write_yaml(&target_dir.join(file), &content)?;
        }
    }

    write_leftovers(info, target_dir, &mut model)?;
    Ok(())
}

/// Removes every `*.yml` under `dir` and prunes directories left empty.
fn clear_model_files(dir: &Path) -> Result<(), ModelError> {
    if !dir.is_dir() {
        return Ok(());
    }
    // contents_first so files go before their parent directories.
    for entry in WalkDir::new(dir).contents_first(true) {
        let entry = entry.map_err(|e| ModelError::Io {
            path: dir.to_path_buf(),
            source: e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
        })?;
        let path = entry.path();
        if entry.file_type().is_file() {
            if path.extension().and_then(OsStr::to_str) == Some("yml") {
                fs::remove_file(path).map_err(|source| ModelError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
        } else if entry.file_type().is_dir() && path != dir {
            let empty = fs::read_dir(path)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if empty {
                fs::remove_dir(path).map_err(|source| ModelError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
        }
    }
    Ok(())
}

/// Rebuilds the content of one file from its descriptors, consuming the
/// claimed data from `model` so leftovers can be detected afterwards.
/// `product` is the exception: it appears in every file and is never consumed.
fn reconstruct_file(
    descriptors: &[SectionDescriptor],
    info: &FileInfo,
    model: &mut InputModel,
) -> Mapping {
    let mut content = Mapping::new();
    for descriptor in descriptors {
        match descriptor {
            SectionDescriptor::Whole { section } => {
                let value = if section == PRODUCT {
                    model.get(section).cloned()
                } else {
                    model.remove(section)
                };
                if let Some(value) = value {
                    content.insert(Value::String(section.clone()), value);
                }
            }
            SectionDescriptor::List {
                section,
                key_field,
                keys,
            } => {
                let owners = info.sections.get(section).map_or(0, Vec::len);
                if owners <= 1 {
                    if let Some(value) = model.remove(section) {
                        content.insert(Value::String(section.clone()), value);
                    }
                } else if let Some(Value::Sequence(records)) = model.get_mut(section) {
                    let mut mine = Vec::new();
                    let mut rest = Vec::new();
                    for record in records.drain(..) {
                        let claimed = record
                            .get(key_field.as_str())
                            .map(|key| keys.contains(key))
                            .unwrap_or(false);
                        if claimed {
                            mine.push(record);
                        } else {
                            rest.push(record);
                        }
                    }
                    *records = rest;
                    if !mine.is_empty() {
                        content.insert(Value::String(section.clone()), Value::Sequence(mine));
                    }
                }
            }
            SectionDescriptor::Object { section, paths } => {
                let mut section_data = Mapping::new();
                for path in paths {
                    let plucked = model.get(section).and_then(|v| pluck(v, path)).cloned();
                    if let Some(value) = plucked {
                        set_path(&mut section_data, path, value);
                        if section == PASS_THROUGH {
                            if let Some(source) = model.get_mut(section) {
                                delete_path(source, path);
                            }
                        }
                    }
                }
                if !section_data.is_empty() {
                    content.insert(Value::String(section.clone()), Value::Mapping(section_data));
                }
            }
        }
    }
    content
}

/// A reconstruction containing nothing, or only the product marker, is not
/// written back.
fn is_meaningful(content: &Mapping) -> bool {
    match content.len() {
        0 => false,
        1 => content.get(&Value::String(PRODUCT.to_string())).is_none(),
        _ => true,
    }
}

/// Writes data no descriptor claimed: brand-new sections get a file of their
/// own, grown one-record-per-file sections get a file per record, other grown
/// list sections accumulate into a single file, and leftover object data gets
/// a uniquely suffixed file.
fn write_leftovers(
    info: &FileInfo,
    target_dir: &Path,
    model: &mut InputModel,
) -> Result<(), ModelError> {
    let product = model.get(PRODUCT).cloned();

    let pending: Vec<String> = model
        .sections
        .iter()
        .filter_map(|(section, value)| match value {
            _ if section == PRODUCT => None,
            Value::Sequence(records) if !records.is_empty() => Some(section.clone()),
            Value::Mapping(map) if !map.is_empty() => {
                if !info.sections.contains_key(section) || section == PASS_THROUGH {
                    Some(section.clone())
                } else {
                    None
                }
            }
            _ => None,
        })
        .collect();

    for section in pending {
        let Some(value) = model.remove(&section) else {
            continue;
        };
        debug!(%section, "Writing unclaimed model data to a new file");
        let is_new = !info.sections.contains_key(&section);
        match value {
            Value::Sequence(records) if !is_new => {
                if info.is_split_per_record(&section) {
                    for record in records {
                        let key = record_key(&record, info, &section)?;
                        let path = new_file_path(target_dir, &section, Some(&key));
                        write_new_file(&path, &section, Value::Sequence(vec![record]), &product)?;
                    }
                } else {
                    let key = records
                        .first()
                        .map(|record| record_key(record, info, &section))
                        .transpose()?
                        .ok_or_else(|| ModelError::UnresolvableSection(section.clone()))?;
                    let path = new_file_path(target_dir, &section, Some(&key));
                    write_new_file(&path, &section, Value::Sequence(records), &product)?;
                }
            }
            Value::Mapping(map) if !is_new => {
                let unique = Uuid::new_v4().simple().to_string();
                let path = new_file_path(target_dir, &section, Some(&unique[..8]));
                write_new_file(&path, &section, Value::Mapping(map), &product)?;
            }
            value => {
                let path = new_file_path(target_dir, &section, None);
                write_new_file(&path, &section, value, &product)?;
            }
        }
    }
    Ok(())
}

/// Key value of a record in a grown list section, as a file name fragment.
fn record_key(record: &Value, info: &FileInfo, section: &str) -> Result<String, ModelError> {
    let key_field = info
        .key_field_for(section)
        .ok_or_else(|| ModelError::UnresolvableSection(section.to_string()))?;
    match record.get(key_field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(ModelError::UnresolvableSection(section.to_string())),
    }
}

fn new_file_path(target_dir: &Path, section: &str, suffix: Option<&str>) -> PathBuf {
    let mut name = section.replace('-', "_");
    if let Some(suffix) = suffix {
        name.push('_');
        name.push_str(suffix);
    }
    name.push_str(".yml");
    target_dir.join(NEW_MODEL_DIR).join(name.to_lowercase())
}

fn write_new_file(
    path: &Path,
    section: &str,
    value: Value,
    product: &Option<Value>,
) -> Result<(), ModelError> {
    let mut content = Mapping::new();
    if let Some(product) = product {
        content.insert(Value::String(PRODUCT.to_string()), product.clone());
    }
    content.insert(Value::String(section.to_string()), value);
    write_yaml(path, &content)
}

fn write_yaml(path: &Path, content: &Mapping) -> Result<(), ModelError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ModelError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let text = serde_yaml::to_string(content)?;
    fs::write(path, text).map_err(|source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Follows a dotted path through nested mappings.
fn pluck<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |cur, part| cur.get(part))
}

/// Sets `value` at a dotted path, creating intermediate mappings.
fn set_path(map: &mut Mapping, path: &str, value: Value) {
    let mut parts = path.split('.').peekable();
    let mut cur = map;
    while let Some(part) = parts.next() {
        let key = Value::String(part.to_string());
        if parts.peek().is_none() {
            cur.insert(key, value);
            return;
        }
        let entry = cur
            .entry(key)
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        if !entry.is_mapping() {
            *entry = Value::Mapping(Mapping::new());
        }
        match entry {
            Value::Mapping(next) => cur = next,
            _ => return,
        }
    }
}

/// Removes the value at a dotted path and prunes parents emptied by it.
fn delete_path(root: &mut Value, path: &str) {
    let parts: Vec<&str> = path.split('.').collect();
    remove_at(root, &parts);
}

fn remove_at(value: &mut Value, parts: &[&str]) {
    let Some(map) = value.as_mapping_mut() else {
        return;
    };
    let Some((head, rest)) = parts.split_first() else {
        return;
    };
    let key = Value::String((*head).to_string());
    if rest.is_empty() {
        map.remove(&key);
        return;
    }
    if let Some(child) = map.get_mut(&key) {
        remove_at(child, rest);
        let emptied = child.as_mapping().is_some_and(Mapping::is_empty);
        if emptied {
            map.remove(&key);
        }
    }
}
