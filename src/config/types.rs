use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_workers() -> usize {
    4
}
fn default_max_body_b() -> u64 {
    2 * 1024 * 1024
}
fn default_verify_default() -> bool {
    true
}
fn default_chunk_raw_b() -> u64 {
    12 * 1024
}
fn default_chunk_upload_b() -> u64 {
    600 * 1024
}
fn default_heartbeat_s() -> f64 {
    10.0
}
fn default_batch_lines() -> usize {
    24
}
fn default_batch_latency() -> f64 {
    0.08
}
fn default_retries() -> u32 {
    4
}
fn default_retry_backoff() -> f64 {
    0.5
}
fn default_retry_cap() -> f64 {
    4.0
}

/// HTTP relay tuning, shared by every Relay Node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_body_b")]
    pub max_body_b: u64,
    #[serde(default = "default_verify_default")]
    pub verify_default: bool,
    #[serde(default = "default_chunk_raw_b")]
    pub chunk_raw_b: u64,
    #[serde(default = "default_chunk_upload_b")]
    pub chunk_upload_b: u64,
    #[serde(default = "default_heartbeat_s")]
    pub heartbeat_s: f64,
    #[serde(default = "default_batch_lines")]
    pub batch_lines: usize,
    #[serde(default = "default_batch_latency")]
    pub batch_latency: f64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: f64,
    #[serde(default = "default_retry_cap")]
    pub retry_cap: f64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_body_b: default_max_body_b(),
            verify_default: default_verify_default(),
            chunk_raw_b: default_chunk_raw_b(),
            chunk_upload_b: default_chunk_upload_b(),
            heartbeat_s: default_heartbeat_s(),
            batch_lines: default_batch_lines(),
            batch_latency: default_batch_latency(),
            retries: default_retries(),
            retry_backoff: default_retry_backoff(),
            retry_cap: default_retry_cap(),
        }
    }
}

fn default_num_subclients() -> u32 {
    2
}
fn default_seed_ws() -> String {
    String::new()
}
fn default_self_probe_ms() -> u64 {
    12_000
}
fn default_self_probe_fails() -> u32 {
    3
}
fn default_send_queue_cap() -> usize {
    2000
}
fn default_bridge_exe() -> String {
    "overlay-bridge".to_string()
}

/// Parameters passed through to each child bridge process via its environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_num_subclients")]
    pub num_subclients: u32,
    #[serde(default = "default_seed_ws")]
    pub seed_ws: String,
    #[serde(default = "default_self_probe_ms")]
    pub self_probe_ms: u64,
    #[serde(default = "default_self_probe_fails")]
    pub self_probe_fails: u32,
    #[serde(default = "default_send_queue_cap")]
    pub send_queue_cap: usize,
    /// Path to the bridge executable. The embedded process-supervisor (out of
    /// scope here) is expected to provide it on PATH or as an absolute path.
    #[serde(default = "default_bridge_exe")]
    pub bridge_exe: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            num_subclients: default_num_subclients(),
            seed_ws: default_seed_ws(),
            self_probe_ms: default_self_probe_ms(),
            self_probe_fails: default_self_probe_fails(),
            send_queue_cap: default_send_queue_cap(),
            bridge_exe: default_bridge_exe(),
        }
    }
}

/// Immutable per-service definition: canonical target, aliases, static port whitelist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDef {
    pub name: String,
    pub target: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Append-only log file consumed by port discovery. Services with no
    /// log file are never subject to on-demand or periodic whitelisting.
    #[serde(default)]
    pub log_file: Option<String>,
    /// Prefer a chunked stream over a single embedded response when a job
    /// doesn't explicitly request a framing — responses can be large enough
    /// (e.g. a pointcloud) that buffering the whole body first is wasteful.
    #[serde(default)]
    pub default_stream: bool,
}

/// A service's relay identity: its seed and the name derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRecord {
    pub seed: String,
    pub name: String,
    pub created_at: u64,
    #[serde(default)]
    pub rotated_at: Option<u64>,
}

fn default_port_isolation_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_port_isolation_enabled")]
    pub port_isolation_enabled: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            port_isolation_enabled: default_port_isolation_enabled(),
        }
    }
}

fn default_services() -> HashMap<String, ServiceDef> {
    let mut m = HashMap::new();
    m.insert(
        "whisper_asr".to_string(),
        ServiceDef {
            name: "whisper_asr".to_string(),
            target: "http://127.0.0.1:8126".to_string(),
            aliases: vec!["asr".into(), "whisper".into(), "whisper_asr".into()],
            ports: (8126..8136).collect(),
            log_file: Some(".logs/whisper_asr.log".to_string()),
            default_stream: false,
        },
    );
    m.insert(
        "piper_tts".to_string(),
        ServiceDef {
            name: "piper_tts".to_string(),
            target: "http://127.0.0.1:8123".to_string(),
            aliases: vec!["tts".into(), "piper".into(), "piper_tts".into()],
            ports: (8123..8133).collect(),
            log_file: Some(".logs/piper_tts.log".to_string()),
            default_stream: false,
        },
    );
    m.insert(
        "ollama_farm".to_string(),
        ServiceDef {
            name: "ollama_farm".to_string(),
            target: "http://127.0.0.1:11434".to_string(),
            aliases: vec!["ollama".into(), "llm".into(), "ollama_farm".into()],
            ports: [11434u16, 8080].into_iter().chain(11435..11445).collect(),
            log_file: Some(".logs/ollama_farm.log".to_string()),
            default_stream: false,
        },
    );
    m.insert(
        "mcp_server".to_string(),
        ServiceDef {
            name: "mcp_server".to_string(),
            target: "http://127.0.0.1:9003".to_string(),
            aliases: vec!["mcp".into(), "context".into(), "mcp_server".into()],
            ports: (9003..9013).collect(),
            log_file: Some(".logs/mcp_server.log".to_string()),
            default_stream: false,
        },
    );
    m.insert(
        "web_scrape".to_string(),
        ServiceDef {
            name: "web_scrape".to_string(),
            target: "http://127.0.0.1:8130".to_string(),
            aliases: vec![
                "browser".into(),
                "chrome".into(),
                "scrape".into(),
                "web_scrape".into(),
            ],
            ports: (8130..8140).collect(),
            log_file: Some(".logs/web_scrape.log".to_string()),
            default_stream: false,
        },
    );
    m.insert(
        "depth_any".to_string(),
        ServiceDef {
            name: "depth_any".to_string(),
            target: "http://127.0.0.1:5000".to_string(),
            aliases: vec!["depth".into(), "pointcloud".into(), "depth_any".into()],
            ports: (5000..5010).collect(),
            log_file: Some(".logs/depth_any.log".to_string()),
            default_stream: true,
        },
    );
    m
}

/// Top-level router configuration, loaded from `router_config.json` (or `.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default = "default_services")]
    pub services: HashMap<String, ServiceDef>,
    /// Per-service relay identity. Absent entries are generated at first startup.
    #[serde(default)]
    pub relays: HashMap<String, RelayRecord>,
    /// Service -> node-id assignment, seeded at startup and then owned at runtime
    /// by the Router under its assignment mutex.
    #[serde(default)]
    pub assignments: HashMap<String, String>,
    #[serde(default)]
    pub enabled: HashMap<String, bool>,
    #[serde(default)]
    pub security: SecurityConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            bridge: BridgeConfig::default(),
            services: default_services(),
            relays: HashMap::new(),
            assignments: HashMap::new(),
            enabled: HashMap::new(),
            security: SecurityConfig::default(),
        }
    }
}

impl RouterConfig {
    pub fn is_enabled(&self, service: &str) -> bool {
        self.enabled.get(service).copied().unwrap_or(true)
    }
}
