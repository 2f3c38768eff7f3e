//! Layered YAML configuration: load, deep-merge, canonicalize, hash, and
//! check for keys nothing in the process actually reads.

mod consumption;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

pub use consumption::{consumed_pointers, ConfigMode};

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut sources = Vec::with_capacity(paths.len());
    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        sources.push(s);
    }
    let borrowed: Vec<&str> = sources.iter().map(String::as_str).collect();
    load_layered_yaml_from_strings(&borrowed)
}

/// Same merge/canonicalize/hash pipeline as [`load_layered_yaml`], but over
/// in-memory YAML documents. Used directly by tests and by callers that
/// already have config text (e.g. fetched from a secrets store).
pub fn load_layered_yaml_from_strings(docs: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for doc in docs {
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(doc).context("parse yaml layer")?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Ok(LoadedConfig {
        config_json: serde_json::from_str(&canonical).context("canonical json parse failed")?,
        canonical_json: canonical,
        config_hash: hash,
    })
}

fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnusedKeyPolicy {
    Warn,
    Fail,
}

#[derive(Debug, Clone, Default)]
pub struct UnusedKeyReport {
    pub unused_leaf_pointers: Vec<String>,
}

impl UnusedKeyReport {
    pub fn is_clean(&self) -> bool {
        self.unused_leaf_pointers.is_empty()
    }
}

/// Walk every leaf pointer in `config_json` and flag the ones not in the
/// consumed-pointer registry for `mode`. `Fail` turns a non-empty report
/// into an error; `Warn` returns the report for the caller to log.
pub fn report_unused_keys(
    mode: ConfigMode,
    config_json: &Value,
    policy: UnusedKeyPolicy,
) -> Result<UnusedKeyReport> {
    let consumed = consumed_pointers(mode);
    let mut unused = Vec::new();
    collect_leaf_pointers(config_json, String::new(), &mut unused);
    unused.retain(|ptr| !consumed.contains(&ptr.as_str()));
    unused.sort();

    let report = UnusedKeyReport {
        unused_leaf_pointers: unused,
    };

    if policy == UnusedKeyPolicy::Fail && !report.is_clean() {
        bail!(
            "CONFIG_UNUSED_KEYS: {} unused key(s): {}",
            report.unused_leaf_pointers.len(),
            report.unused_leaf_pointers.join(", ")
        );
    }

    Ok(report)
}

fn collect_leaf_pointers(v: &Value, prefix: String, out: &mut Vec<String>) {
    match v {
        Value::Object(map) => {
            for (k, val) in map {
                collect_leaf_pointers(val, format!("{prefix}/{k}"), out);
            }
        }
        _ => out.push(prefix),
    }
}

/// Typed view over the options enumerated in the external configuration
/// surface. Loaded once at process startup and held immutable.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub embedder: EmbedderConfig,
    pub llm: LlmConfig,
    pub dup_similarity_threshold: f64,
    pub category_similarity_threshold: f64,
    pub eval: EvalConfig,
    pub dispatch: DispatchConfig,
    pub fx: FxConfig,
    pub impossible_travel: ImpossibleTravelConfig,
    pub log: LogConfig,
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbedderConfig {
    pub model: String,
    pub dim: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub base_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvalConfig {
    pub timeout_ms: u64,
    pub workers: usize,
    pub queue_max: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    pub retries: u32,
    pub backoff_base_ms: u64,
    pub workers: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FxConfig {
    pub table_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImpossibleTravelConfig {
    pub max_kmh: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    pub addr: String,
}

impl AppConfig {
    pub fn from_loaded(loaded: &LoadedConfig) -> Result<Self> {
        serde_json::from_value(loaded.config_json.clone()).context("config does not match AppConfig shape")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            embedder: EmbedderConfig {
                model: "text-embedding-3-small".into(),
                dim: 1536,
            },
            llm: LlmConfig {
                provider: "openai".into(),
                model: "gpt-4o-mini".into(),
                base_url: "https://api.openai.com/v1".into(),
                api_key: String::new(),
            },
            dup_similarity_threshold: 0.92,
            category_similarity_threshold: 0.80,
            eval: EvalConfig {
                timeout_ms: 2_000,
                workers: num_cpus_fallback() * 4,
                queue_max: 10_000,
            },
            dispatch: DispatchConfig {
                retries: 5,
                backoff_base_ms: 200,
                workers: num_cpus_fallback() * 4,
            },
            fx: FxConfig {
                table_path: "config/fx_rates.yaml".into(),
            },
            impossible_travel: ImpossibleTravelConfig { max_kmh: 800.0 },
            log: LogConfig {
                level: "info".into(),
            },
            daemon: DaemonConfig {
                addr: "0.0.0.0:8080".into(),
            },
        }
    }
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
