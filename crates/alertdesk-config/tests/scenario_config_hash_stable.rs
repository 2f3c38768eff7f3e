//! Hash stability under key reordering and layering.

use alertdesk_config::load_layered_yaml_from_strings;

const BASE_YAML: &str = r#"
embedder:
  model: "text-embedding-3-small"
  dim: 1536
llm:
  provider: "openai"
  model: "gpt-4o-mini"
  base_url: "https://api.openai.com/v1"
  api_key: "OPENAI_API_KEY"
dup_similarity_threshold: 0.92
category_similarity_threshold: 0.80
eval:
  timeout_ms: 2000
  workers: 16
  queue_max: 10000
dispatch:
  retries: 5
  backoff_base_ms: 200
  workers: 16
fx:
  table_path: "config/fx_rates.yaml"
impossible_travel:
  max_kmh: 800.0
log:
  level: "info"
daemon:
  addr: "0.0.0.0:8080"
"#;

const BASE_YAML_REORDERED: &str = r#"
log:
  level: "info"
daemon:
  addr: "0.0.0.0:8080"
dup_similarity_threshold: 0.92
category_similarity_threshold: 0.80
dispatch:
  workers: 16
  retries: 5
  backoff_base_ms: 200
fx:
  table_path: "config/fx_rates.yaml"
impossible_travel:
  max_kmh: 800.0
eval:
  queue_max: 10000
  timeout_ms: 2000
  workers: 16
llm:
  api_key: "OPENAI_API_KEY"
  base_url: "https://api.openai.com/v1"
  model: "gpt-4o-mini"
  provider: "openai"
embedder:
  dim: 1536
  model: "text-embedding-3-small"
"#;

const OVERLAY_YAML: &str = r#"
log:
  level: "debug"
dup_similarity_threshold: 0.95
"#;

#[test]
fn same_input_produces_identical_hash() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();

    assert_eq!(a.config_hash, b.config_hash);
    assert_eq!(a.canonical_json, b.canonical_json);
}

#[test]
fn reordered_keys_produce_same_hash() {
    let original = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let reordered = load_layered_yaml_from_strings(&[BASE_YAML_REORDERED]).unwrap();

    assert_eq!(original.config_hash, reordered.config_hash);
    assert_eq!(original.canonical_json, reordered.canonical_json);
}

#[test]
fn merged_layers_produce_stable_hash_and_override() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML, OVERLAY_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_YAML, OVERLAY_YAML]).unwrap();

    assert_eq!(a.config_hash, b.config_hash);

    let level = a
        .config_json
        .pointer("/log/level")
        .and_then(|v| v.as_str())
        .unwrap();
    assert_eq!(level, "debug");

    let threshold = a
        .config_json
        .pointer("/dup_similarity_threshold")
        .and_then(|v| v.as_f64())
        .unwrap();
    assert!((threshold - 0.95).abs() < 1e-9);
}

#[test]
fn hash_is_64_hex_chars() {
    let loaded = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    assert_eq!(loaded.config_hash.len(), 64);
    assert!(loaded.config_hash.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn empty_config_produces_stable_hash() {
    let a = load_layered_yaml_from_strings(&["{}"]).unwrap();
    let b = load_layered_yaml_from_strings(&["{}"]).unwrap();
    assert_eq!(a.config_hash, b.config_hash);
}
