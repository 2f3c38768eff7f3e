/// Which process is consuming the config; each reads a different subset of
/// the enumerated configuration surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigMode {
    Daemon,
    Orchestrator,
    Cli,
}

pub fn consumed_pointers(mode: ConfigMode) -> &'static [&'static str] {
    match mode {
        ConfigMode::Daemon => DAEMON,
        ConfigMode::Orchestrator => ORCHESTRATOR,
        ConfigMode::Cli => CLI,
    }
}

static DAEMON: &[&str] = &[
    "/log/level",
    "/daemon/addr",
    "/eval/queue_max",
];

static ORCHESTRATOR: &[&str] = &[
    "/log/level",
    "/embedder/model",
    "/embedder/dim",
    "/llm/provider",
    "/llm/model",
    "/llm/base_url",
    "/llm/api_key",
    "/dup_similarity_threshold",
    "/category_similarity_threshold",
    "/eval/timeout_ms",
    "/eval/workers",
    "/eval/queue_max",
    "/dispatch/retries",
    "/dispatch/backoff_base_ms",
    "/dispatch/workers",
    "/fx/table_path",
    "/impossible_travel/max_kmh",
];

static CLI: &[&str] = &["/log/level"];
