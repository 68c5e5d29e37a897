//! Global configuration types for runloom.
//!
//! `GlobalConfig` represents the top-level `config.toml`. Every field has a
//! default so an empty or partial file is valid.

use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from `<data_dir>/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Execution limits and cache settings for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Lifetime of an idempotency cache entry.
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,

    /// Action timeout used when a node has no `timeout_ms`.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Upper bound for `loop_while` iterations when a node sets none.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,

    /// Maximum concurrently executing nodes per scope.
    #[serde(default = "default_max_parallel_nodes")]
    pub max_parallel_nodes: usize,

    /// Results larger than this (serialized) are slimmed before caching.
    #[serde(default = "default_slim_result_max_bytes")]
    pub slim_result_max_bytes: usize,
}

fn default_idempotency_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_loop_iterations() -> u32 {
    100
}

fn default_max_parallel_nodes() -> usize {
    32
}

fn default_slim_result_max_bytes() -> usize {
    16 * 1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl_secs: default_idempotency_ttl_secs(),
            default_timeout_ms: default_timeout_ms(),
            max_loop_iterations: default_max_loop_iterations(),
            max_parallel_nodes: default_max_parallel_nodes(),
            slim_result_max_bytes: default_slim_result_max_bytes(),
        }
    }
}

/// Connection settings for the HTTP tool-execution provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the provider, e.g. `https://tools.example.com/v1`.
    /// When unset only dry runs are possible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Name of the environment variable holding the bearer token.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_api_key_env() -> String {
    "RUNLOOM_PROVIDER_TOKEN".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key_env: default_api_key_env(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// REST server bind address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}
