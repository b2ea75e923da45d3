use super::*;
use std::fs;
use tempfile::TempDir;

#[test]
fn render_masks_the_api_key() {
    let mut config = Config::with_base_dir("/tmp/semvault-render");
    config.provider.api_key = "sk-very-secret".to_string();
    config.provider.dimension = 768;

    let rendered = render_config(&config);
    assert!(rendered.contains("nomic-embed-text"));
    assert!(rendered.contains("SingleDocument"));
    assert!(rendered.contains("768"));
    assert!(!rendered.contains("sk-very-secret"));
    assert!(rendered.contains("config.toml"));
}

#[test]
fn render_reports_invalid_endpoints() {
    let mut config = Config::default();
    config.provider.endpoint = "nowhere".to_string();
    assert!(render_config(&config).contains("Invalid"));
}

#[test]
fn init_writes_defaults_once() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");

    let (config, created) = init_config(temp_dir.path()).expect("should init config");
    assert!(created);
    assert_eq!(config.provider, ProviderConfig::default());
    assert!(temp_dir.path().join(CONFIG_FILE).exists());

    fs::write(
        temp_dir.path().join(CONFIG_FILE),
        "[provider]\nmodel = \"custom-model\"\n",
    )
    .expect("should write config");

    let (config, created) = init_config(temp_dir.path()).expect("should load existing config");
    assert!(!created);
    assert_eq!(config.provider.model, "custom-model");
}
