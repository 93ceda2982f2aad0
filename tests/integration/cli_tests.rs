//! CLI integration tests
//!
//! Runs the built `lora-merge` binary against fixture checkpoints.

use super::fixtures::*;
use super::init_test_logging;
use std::path::Path;
use std::process::Command;

/// Run the CLI with an empty config file and capture output
fn run_cli_command(config_dir: &Path, args: &[&str]) -> (String, String, bool) {
    let config = config_dir.join("config.yaml");
    if !config.exists() {
        std::fs::write(&config, "{}\n").unwrap();
    }

    let output = Command::new(env!("CARGO_BIN_EXE_lora-merge"))
        .arg("--config")
        .arg(&config)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run lora-merge");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_cli_help_command() {
    init_test_logging();
    let (_temp_dir, root) = create_test_dir();

    let (stdout, _, success) = run_cli_command(&root, &["--help"]);
    assert!(success, "Help command failed");
    assert!(stdout.contains("merge"));
    assert!(stdout.contains("inspect"));
    assert!(stdout.contains("completions"));
}

#[test]
fn test_cli_merge_json_summary() {
    init_test_logging();
    let (_temp_dir, root) = create_test_dir();
    let (base, adapter, out) = (root.join("base"), root.join("adapter"), root.join("out"));
    create_base_model(&base, BaseModelOptions::default());
    create_adapter(&adapter);

    let (stdout, stderr, success) = run_cli_command(
        &root,
        &[
            "--json",
            "merge",
            base.to_str().unwrap(),
            adapter.to_str().unwrap(),
            "--save-path",
            out.to_str().unwrap(),
        ],
    );
    assert!(success, "merge failed: {}", stderr);

    let summary: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(summary["submodule"], "thinker");
    assert_eq!(summary["merge"]["merged_layers"], 1);
    assert_eq!(summary["extra_file_copied"], true);
    assert!(out.join("model.safetensors").exists());
}

#[test]
fn test_cli_unknown_submodule_fails() {
    init_test_logging();
    let (_temp_dir, root) = create_test_dir();
    let (base, adapter, out) = (root.join("base"), root.join("adapter"), root.join("out"));
    create_base_model(&base, BaseModelOptions::default());
    create_adapter(&adapter);

    let (_, stderr, success) = run_cli_command(
        &root,
        &[
            "merge",
            base.to_str().unwrap(),
            adapter.to_str().unwrap(),
            "--save-path",
            out.to_str().unwrap(),
            "--submodule-name",
            "vision",
        ],
    );
    assert!(!success);
    assert!(stderr.contains("The model does not have a submodule named 'vision'."));
    assert!(stderr.contains("talker, thinker, token2wav"));
}

#[test]
fn test_cli_config_supplies_submodule() {
    init_test_logging();
    let (_temp_dir, root) = create_test_dir();
    let (base, adapter, out) = (root.join("base"), root.join("adapter"), root.join("out"));
    create_base_model(&base, BaseModelOptions::default());
    create_adapter(&adapter);
    std::fs::write(
        root.join("config.yaml"),
        "merge:\n  submodule_name: talker\n  extra_file: missing.pt\n",
    )
    .unwrap();

    let (stdout, stderr, success) = run_cli_command(
        &root,
        &[
            "--json",
            "merge",
            base.to_str().unwrap(),
            adapter.to_str().unwrap(),
            "--save-path",
            out.to_str().unwrap(),
        ],
    );
    assert!(success, "merge failed: {}", stderr);

    let summary: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(summary["submodule"], "talker");
    assert_eq!(summary["extra_file_copied"], false);
}

#[test]
fn test_cli_inspect_lists_submodules() {
    init_test_logging();
    let (_temp_dir, root) = create_test_dir();
    let (base, adapter) = (root.join("base"), root.join("adapter"));
    create_base_model(&base, BaseModelOptions::default());
    create_adapter(&adapter);

    let (stdout, stderr, success) = run_cli_command(
        &root,
        &[
            "--json",
            "inspect",
            base.to_str().unwrap(),
            "--adapter",
            adapter.to_str().unwrap(),
        ],
    );
    assert!(success, "inspect failed: {}", stderr);

    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let names: Vec<&str> = report["submodules"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["talker", "thinker", "token2wav"]);
    assert_eq!(report["adapter"]["missing_targets"].as_array().unwrap().len(), 0);
    assert_eq!(report["adapter"]["summary"]["num_layers"], 1);
}

#[test]
fn test_cli_config_init() {
    init_test_logging();
    let (_temp_dir, root) = create_test_dir();
    let path = root.join("nested").join("lora-merge.toml");

    let output = Command::new(env!("CARGO_BIN_EXE_lora-merge"))
        .args(["config", "init", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success());

    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.contains("submodule_name = \"thinker\""));
}
