//! Integration tests for Configuration System

use docforge::config::{ConfigLoader, ProviderType};
use docforge::template::{FsTemplateRegistry, TemplateProvider};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_full_config_file_round_trips_every_section() {
    let temp_dir = TempDir::new().unwrap();
    let config_file = temp_dir.path().join("docforge.toml");

    std::fs::write(
        &config_file,
        r#"
[provider]
provider_type = "local"
model = "qwen2.5"
endpoint = "http://127.0.0.1:8080/v1"

[pipeline]
batch_size_analysis = 4
batch_size_chapters = 2
chapter_timeout_secs = 90
max_retries = 0
validate_chapters = false
artifact_dir = "out"

[compiler]
draft_program = "pdflatex"
draft_args = ["-draftmode"]
full_program = "pdflatex"
full_args = ["-interaction=nonstopmode"]
work_root = "/tmp/docforge-work"

[templates]
dirs = ["shared/templates"]
custom_dir = "mine"
"#,
    )
    .unwrap();

    let config = ConfigLoader::load_from_file(&config_file).unwrap();
    assert!(config.validate().is_ok());

    assert_eq!(config.provider.provider_type, ProviderType::LocalCustom);
    assert_eq!(config.provider.endpoint.as_deref(), Some("http://127.0.0.1:8080/v1"));

    assert_eq!(config.pipeline.batch_size_analysis, 4);
    assert_eq!(config.pipeline.batch_size_chapters, 2);
    assert_eq!(config.pipeline.chapter_timeout(), Duration::from_secs(90));
    assert_eq!(config.pipeline.analysis_timeout(), Duration::from_secs(180));
    assert_eq!(config.pipeline.max_retries, 0);
    assert!(config.pipeline.auto_fix);
    assert!(!config.pipeline.validate_chapters);
    assert_eq!(config.pipeline.artifact_dir, Some(PathBuf::from("out")));

    assert_eq!(config.compiler.draft_program, "pdflatex");
    assert_eq!(config.compiler.draft_args, vec!["-draftmode".to_string()]);
    assert_eq!(config.compiler.work_root, Some(PathBuf::from("/tmp/docforge-work")));
    assert_eq!(config.compiler.timeout_secs, 120);

    assert_eq!(config.templates.dirs, vec![PathBuf::from("shared/templates")]);
    assert_eq!(config.templates.custom_dir, PathBuf::from("mine"));
}

#[test]
fn test_invalid_values_are_all_reported() {
    let temp_dir = TempDir::new().unwrap();
    let config_file = temp_dir.path().join("docforge.toml");

    std::fs::write(
        &config_file,
        r#"
[provider]
model = "gpt-4o"
endpoint = "localhost:11434"

[pipeline]
batch_size_analysis = 0

[compiler]
timeout_secs = 0
"#,
    )
    .unwrap();

    let config = ConfigLoader::load_from_file(&config_file).unwrap();
    let errors = config.validate().unwrap_err();
    let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
    assert_eq!(messages.len(), 3);
    assert!(messages[0].starts_with("Provider:"));
    assert!(messages[1].contains("batch_size_analysis"));
    assert!(messages[2].starts_with("Compiler:"));
}

#[test]
fn test_wrongly_typed_value_fails_to_load() {
    let temp_dir = TempDir::new().unwrap();
    let config_file = temp_dir.path().join("docforge.toml");
    std::fs::write(&config_file, "[pipeline]\nmax_retries = \"many\"\n").unwrap();

    assert!(ConfigLoader::load_from_file(&config_file).is_err());
}

#[test]
fn test_workspace_without_config_uses_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let config = ConfigLoader::load(temp_dir.path()).unwrap();

    assert_eq!(config.pipeline.batch_size_chapters, 8);
    assert!(config.pipeline.validate_chapters);
    assert_eq!(config.pipeline.artifact_dir, None);
    assert_eq!(config.compiler.full_program, "latexmk");
}

#[test]
fn test_template_settings_resolve_against_workspace() {
    let temp_dir = TempDir::new().unwrap();
    let workspace = temp_dir.path();
    let config_dir = workspace.join("config");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(
        config_dir.join("config.toml"),
        "[templates]\ndirs = [\"vendor\"]\ncustom_dir = \"user\"\n",
    )
    .unwrap();

    let memo = workspace.join("vendor").join("memo");
    std::fs::create_dir_all(&memo).unwrap();
    std::fs::write(memo.join("meta.toml"), "id = \"memo\"\nname = \"Memo\"\n").unwrap();

    let config = ConfigLoader::load(workspace).unwrap();
    let registry = FsTemplateRegistry::from_settings(&config.templates, workspace);
    let ids: Vec<String> = registry
        .list_templates()
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ids, vec!["default".to_string(), "memo".to_string()]);
}
