use super::*;
use crate::embeddings::provider::Dialect;
use tempfile::TempDir;

#[test]
fn default_config() {
    let config = Config::default();
    assert_eq!(config.provider.id, "ollama");
    assert_eq!(config.provider.endpoint, "http://localhost:11434/api/embeddings");
    assert_eq!(config.provider.model, "nomic-embed-text");
    assert_eq!(config.provider.dialect, DialectPreference::Auto);
    assert_eq!(config.provider.dimension(), None);
    assert_eq!(config.processor.batch_size, 32);
    assert_eq!(config.processor.max_concurrency, 3);
    assert_eq!(config.search.min_similarity, 0.1);
    assert!(config.validate().is_ok());
}

#[test]
fn config_validation() {
    let config = Config::default();

    let mut invalid_config = config.clone();
    invalid_config.provider.endpoint = "ftp://localhost/embed".to_string();
    assert!(matches!(invalid_config.validate(), Err(ConfigError::InvalidUrl(_))));

    let mut invalid_config = config.clone();
    invalid_config.provider.endpoint = "not a url".to_string();
    assert!(matches!(invalid_config.validate(), Err(ConfigError::InvalidUrl(_))));

    let mut invalid_config = config.clone();
    invalid_config.provider.model = "  ".to_string();
    assert!(matches!(invalid_config.validate(), Err(ConfigError::InvalidModel(_))));

    let mut invalid_config = config.clone();
    invalid_config.provider.max_batch_size = 1001;
    assert!(matches!(invalid_config.validate(), Err(ConfigError::InvalidBatchSize(1001))));

    let mut invalid_config = config.clone();
    invalid_config.processor.batch_size = 0;
    assert!(matches!(invalid_config.validate(), Err(ConfigError::InvalidBatchSize(0))));

    let mut invalid_config = config.clone();
    invalid_config.processor.max_concurrency = 65;
    assert!(matches!(invalid_config.validate(), Err(ConfigError::InvalidConcurrency(65))));

    let mut invalid_config = config.clone();
    invalid_config.provider.timeout_seconds = 0;
    assert!(matches!(invalid_config.validate(), Err(ConfigError::InvalidTimeout(0))));

    let mut invalid_config = config.clone();
    invalid_config.chunking.overlap_ratio = 0.5;
    assert!(matches!(invalid_config.validate(), Err(ConfigError::InvalidOverlapRatio(_))));

    let mut invalid_config = config.clone();
    invalid_config.chunking.target_chunk_chars = 150;
    assert!(matches!(
        invalid_config.validate(),
        Err(ConfigError::InvalidTargetChunkSize(150))
    ));

    let mut invalid_config = config.clone();
    invalid_config.chunking.min_content_chars = invalid_config.chunking.max_content_chars;
    assert!(matches!(
        invalid_config.validate(),
        Err(ConfigError::ContentBoundsInverted(_, _))
    ));

    let mut invalid_config = config;
    invalid_config.search.async_chunk_size = 0;
    assert!(matches!(invalid_config.validate(), Err(ConfigError::InvalidSliceSize(0))));
}

#[test]
fn toml_serialization() {
    let mut config = Config::default();
    config.provider.api_key = "secret".to_string();
    config.provider.dialect = DialectPreference::Batched;
    let toml_str = toml::to_string(&config).expect("should serialize toml correctly");
    assert!(toml_str.contains("dialect = \"batched\""));

    let parsed_config: Config = toml::from_str(&toml_str).expect("should parse toml correctly");
    assert_eq!(config, parsed_config);
}

#[test]
fn partial_files_fill_in_defaults() {
    let parsed: Config = toml::from_str(
        r#"
        [provider]
        endpoint = "https://api.example.com/v1/embeddings"
        model = "text-embedding-3-small"
        dimension = 1536

        [search]
        min_similarity = 0.25
        "#,
    )
    .expect("should parse partial toml");

    assert_eq!(parsed.provider.id, "ollama");
    assert_eq!(parsed.provider.dimension(), Some(1536));
    assert_eq!(parsed.search.min_similarity, 0.25);
    assert_eq!(parsed.search.excerpt_chars, 200);
    assert_eq!(parsed.chunking, ChunkingConfig::default());
    assert_eq!(parsed.processor, ProcessorConfig::default());
}

#[test]
fn load_and_save_round_trip() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let base_dir = temp_dir.path().join("nested");

    let missing = Config::load(&base_dir).expect("missing file yields defaults");
    assert_eq!(missing.base_dir(), base_dir.as_path());
    assert_eq!(missing.provider, ProviderConfig::default());

    let mut config = Config::with_base_dir(&base_dir);
    config.provider.model = "mxbai-embed-large".to_string();
    config.processor.batch_size = 8;
    config.save().expect("should save config");
    assert!(config.config_file_path().exists());

    let loaded = Config::load(&base_dir).expect("should load saved config");
    assert_eq!(loaded, config);
    assert_eq!(loaded.database_path(), base_dir.join("embeddings.db"));
}

#[test]
fn invalid_files_are_rejected_on_load_and_save() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    fs::write(
        temp_dir.path().join(CONFIG_FILE),
        "[processor]\nbatch_size = 0\n",
    )
    .expect("should write config");
    assert!(Config::load(temp_dir.path()).is_err());

    fs::write(temp_dir.path().join(CONFIG_FILE), "[provider\nmodel = ")
        .expect("should write config");
    assert!(Config::load(temp_dir.path()).is_err());

    let mut config = Config::with_base_dir(temp_dir.path());
    config.provider.max_concurrency = 0;
    assert!(config.save().is_err());
}

#[test]
fn provider_options_resolve_the_dialect() {
    let mut config = Config::default();
    config.provider.api_key = "  ".to_string();
    let options = config.provider_options();
    assert_eq!(options.dialect, Dialect::SingleDocument);
    assert_eq!(options.api_key, None);
    assert_eq!(options.max_batch_size, 64);
    assert_eq!(options.retry_attempts, 3);

    config.provider.endpoint = "http://localhost:11434/api/embed".to_string();
    config.provider.api_key = "token".to_string();
    let options = config.provider_options();
    assert_eq!(options.dialect, Dialect::Batched);
    assert_eq!(options.api_key.as_deref(), Some("token"));

    config.provider.dialect = DialectPreference::SingleDocument;
    assert_eq!(config.provider_options().dialect, Dialect::SingleDocument);
}
