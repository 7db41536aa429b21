// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Round-trip tests for the input model store: a model read into memory and
//! written back reproduces the operator's file layout, and grown sections
//! land in the right files.

use std::fs;
use std::path::Path;

use serde_yaml::Value;
use tempfile::TempDir;

use aegis_deploy_core::domain::model::{ModelError, SectionDescriptor};
use aegis_deploy_core::infrastructure::model_reader::read_model;
use aegis_deploy_core::infrastructure::model_writer::write_model;

const PRODUCT: &str = "product:\n  version: 2\n";

fn write_file(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// A small but representative model: a single-file list section, a
/// one-record-per-file list section in a subdirectory, a single-file object
/// section and a pass-through section spread over two files.
fn fixture_model(dir: &Path) {
    write_file(dir, "cloudConfig.yml", "product:\n  version: 2\ncloud:\n  name: testcloud\n");
    write_file(
        dir,
        "data/servers.yml",
        &format!(
            "{PRODUCT}servers:\n  - id: server1\n    role: ROLE-A\n  - id: server2\n    role: ROLE-B\n"
        ),
    );
    write_file(
        dir,
        "data/roles/role_a.yml",
        &format!("{PRODUCT}server-roles:\n  - name: ROLE-A\n    interface-model: DEFAULT\n"),
    );
    write_file(
        dir,
        "data/roles/role_b.yml",
        &format!("{PRODUCT}server-roles:\n  - name: ROLE-B\n    interface-model: DEFAULT\n"),
    );
    write_file(
        dir,
        "data/net.yml",
        &format!("{PRODUCT}networking:\n  vlans:\n    mgmt: 10\n"),
    );
    write_file(
        dir,
        "data/pass_one.yml",
        &format!("{PRODUCT}pass-through:\n  global:\n    install-env: legacy\n"),
    );
    write_file(
        dir,
        "data/pass_two.yml",
        &format!("{PRODUCT}pass-through:\n  global:\n    esx-cloud: true\n  servers-meta:\n    flag: 1\n"),
    );
}

fn record(yaml: &str) -> Value {
    serde_yaml::from_str(yaml).unwrap()
}

#[test]
fn read_write_read_round_trips_exactly() {
    let dir = TempDir::new().unwrap();
    fixture_model(dir.path());

    let first = read_model(dir.path(), 2).unwrap();
    assert_eq!(first.name, "testcloud");
    assert!(first.errors.is_empty());
    assert_eq!(
        first.file_info.sections.get("pass-through").unwrap(),
        &vec!["data/pass_one.yml".to_string(), "data/pass_two.yml".to_string()]
    );

    write_model(&first, dir.path()).unwrap();
    let second = read_model(dir.path(), 2).unwrap();

    assert_eq!(second.input_model, first.input_model);
    assert_eq!(second.file_info.files, first.file_info.files);
    assert_eq!(second.file_info.sections, first.file_info.sections);
    assert_eq!(second.file_info.file_section_map, first.file_info.file_section_map);
}

#[test]
fn record_added_to_single_owner_section_stays_in_that_file() {
    let dir = TempDir::new().unwrap();
    fixture_model(dir.path());

    let mut doc = read_model(dir.path(), 2).unwrap();
    if let Some(Value::Sequence(servers)) = doc.input_model.get_mut("servers") {
        servers.push(record("id: server3\nrole: ROLE-B\n"));
    } else {
        panic!("servers section missing");
    }
    write_model(&doc, dir.path()).unwrap();

    let reread = read_model(dir.path(), 2).unwrap();
    assert_eq!(
        reread.file_info.sections.get("servers").unwrap(),
        &vec!["data/servers.yml".to_string()]
    );
    let servers = reread.input_model.get("servers").unwrap();
    assert_eq!(servers.as_sequence().unwrap().len(), 3);
}

#[test]
fn records_added_to_per_record_section_get_their_own_files() {
    let dir = TempDir::new().unwrap();
    fixture_model(dir.path());

    let mut doc = read_model(dir.path(), 2).unwrap();
    if let Some(Value::Sequence(roles)) = doc.input_model.get_mut("server-roles") {
        roles.push(record("name: ROLE-C\ninterface-model: DEFAULT\n"));
        roles.push(record("name: ROLE-D\ninterface-model: DEFAULT\n"));
    } else {
        panic!("server-roles section missing");
    }
    write_model(&doc, dir.path()).unwrap();

    let reread = read_model(dir.path(), 2).unwrap();
    let owners = reread.file_info.sections.get("server-roles").unwrap();
    assert_eq!(owners.len(), 4);
    for rel in ["data/server_roles_role-c.yml", "data/server_roles_role-d.yml"] {
        assert!(owners.contains(&rel.to_string()), "missing {rel} in {owners:?}");
        let descriptors = reread.file_info.file_section_map.get(rel).unwrap();
        let keys = descriptors
            .iter()
            .find_map(|d| match d {
                SectionDescriptor::List { section, keys, .. } if section == "server-roles" => {
                    Some(keys.len())
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(keys, 1);
    }
    assert_eq!(
        reread
            .input_model
            .get("server-roles")
            .unwrap()
            .as_sequence()
            .unwrap()
            .len(),
        4
    );
}

#[test]
fn unevenly_split_section_accumulates_growth_in_one_file() {
    let dir = TempDir::new().unwrap();
    write_file(dir.path(), "cloudConfig.yml", "product:\n  version: 2\ncloud:\n  name: testcloud\n");
    write_file(
        dir.path(),
        "data/nets_a.yml",
        &format!("{PRODUCT}networks:\n  - name: NET-A\n  - name: NET-B\n"),
    );
    write_file(
        dir.path(),
        "data/nets_b.yml",
        &format!("{PRODUCT}networks:\n  - name: NET-C\n"),
    );

    let mut doc = read_model(dir.path(), 2).unwrap();
    if let Some(Value::Sequence(nets)) = doc.input_model.get_mut("networks") {
        nets.push(record("name: NET-D\n"));
        nets.push(record("name: NET-E\n"));
    } else {
        panic!("networks section missing");
    }
    write_model(&doc, dir.path()).unwrap();

    let reread = read_model(dir.path(), 2).unwrap();
    let owners = reread.file_info.sections.get("networks").unwrap();
    assert_eq!(owners.len(), 3);
    assert!(owners.contains(&"data/networks_net-d.yml".to_string()));
    let grown: Value = serde_yaml::from_str(
        &fs::read_to_string(dir.path().join("data/networks_net-d.yml")).unwrap(),
    )
    .unwrap();
    assert_eq!(grown.get("networks").unwrap().as_sequence().unwrap().len(), 2);
}

#[test]
fn brand_new_section_gets_a_file_named_after_it() {
    let dir = TempDir::new().unwrap();
    fixture_model(dir.path());

    let mut doc = read_model(dir.path(), 2).unwrap();
    doc.input_model.insert(
        "firewall-rules",
        record("- name: ping\n  allowed: true\n"),
    );
    write_model(&doc, dir.path()).unwrap();

    let reread = read_model(dir.path(), 2).unwrap();
    assert_eq!(
        reread.file_info.sections.get("firewall-rules").unwrap(),
        &vec!["data/firewall_rules.yml".to_string()]
    );
}

#[test]
fn readme_files_are_collected_not_treated_as_model_data() {
    let dir = TempDir::new().unwrap();
    fixture_model(dir.path());
    write_file(dir.path(), "README.md", "# Cloud model\n");
    write_file(dir.path(), "data/roles/README.txt", "role notes\n");

    let first = read_model(dir.path(), 2).unwrap();
    assert_eq!(
        first.readme.get("md").map(String::as_str),
        Some("# Cloud model\n")
    );
    assert_eq!(
        first.readme.get("txt").map(String::as_str),
        Some("role notes\n")
    );
    assert!(!first.file_info.files.iter().any(|f| f.contains("README")));
    assert!(!first.file_info.file_section_map.contains_key("README.md"));

    // READMEs survive a write untouched and are collected again.
    write_model(&first, dir.path()).unwrap();
    let second = read_model(dir.path(), 2).unwrap();
    assert_eq!(second.readme, first.readme);
}

#[test]
fn split_object_section_is_rejected() {
    let dir = TempDir::new().unwrap();
    write_file(dir.path(), "cloudConfig.yml", "product:\n  version: 2\ncloud:\n  name: testcloud\n");
    write_file(
        dir.path(),
        "data/net_a.yml",
        &format!("{PRODUCT}networking:\n  vlans:\n    mgmt: 10\n"),
    );
    write_file(
        dir.path(),
        "data/net_b.yml",
        &format!("{PRODUCT}networking:\n  routers:\n    core: r1\n"),
    );

    let result = read_model(dir.path(), 2);
    assert!(matches!(
        result,
        Err(ModelError::SplitObjectSection { section, .. }) if section == "networking"
    ));
}

#[test]
fn wrong_schema_version_is_rejected() {
    let dir = TempDir::new().unwrap();
    write_file(dir.path(), "cloudConfig.yml", "product:\n  version: 1\ncloud:\n  name: testcloud\n");
    assert!(matches!(
        read_model(dir.path(), 2),
        Err(ModelError::Version { expected: 2 })
    ));
}

#[test]
fn missing_cloud_name_is_rejected() {
    let dir = TempDir::new().unwrap();
    write_file(dir.path(), "cloudConfig.yml", "product:\n  version: 2\n");
    assert!(matches!(
        read_model(dir.path(), 2),
        Err(ModelError::MissingCloudName)
    ));
}

#[test]
fn unreadable_model_file_collects_an_error() {
    let dir = TempDir::new().unwrap();
    fixture_model(dir.path());
    write_file(dir.path(), "data/broken.yml", "servers: [unclosed\n");

    let doc = read_model(dir.path(), 2).unwrap();
    assert_eq!(doc.errors.len(), 1);
    assert!(doc.errors[0].contains("broken.yml"));
}
