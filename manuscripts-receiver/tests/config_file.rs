use std::{io::Write, path::PathBuf};

use manuscripts_receiver::{
    NamingScheme,
    config::{MAX_CONFIG_BYTES, SavedConfig, load_config_from_path, save_config_to_path},
};

#[test]
fn saved_config_survives_a_reload() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("nested").join("receiver.json");
    let config = SavedConfig {
        display_name: Some("Room 204".to_owned()),
        destination: Some(PathBuf::from("/srv/essays")),
        naming: Some(NamingScheme::SenderPrefixed),
        ..SavedConfig::default()
    };

    save_config_to_path(&path, &config).expect("save config");
    assert_eq!(load_config_from_path(&path).expect("load config"), config);
    assert!(!path.with_extension("json.tmp").exists());

    let raw = std::fs::read_to_string(&path).expect("read config");
    assert!(!raw.contains("passphrase"));
}

#[test]
fn load_config_ignores_oversized_file() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("receiver.json");

    let mut file = std::fs::File::create(&path).expect("create receiver.json");
    file.write_all(&vec![b' '; (MAX_CONFIG_BYTES as usize) + 1024])
        .expect("write oversized receiver.json");
    drop(file);

    let err = load_config_from_path(&path).expect_err("oversized file should error");
    let msg = err.to_string();
    assert!(msg.contains("too large"), "unexpected error: {msg}");
}

#[test]
fn corrupt_config_reports_parse_error() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("receiver.json");
    std::fs::write(&path, "{ not json").expect("write");

    let err = load_config_from_path(&path).expect_err("corrupt file should error");
    assert!(err.to_string().contains("parse failed"), "unexpected error: {err}");
}
