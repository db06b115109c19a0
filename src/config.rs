use clap::Parser;
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use crate::errors::ConfigError;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub cluster: ClusterConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub filter: FilterConfig,
    pub search: SearchConfig,
    pub tool_injection: ToolInjectionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8080 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info,gateway=debug".to_string(), file: None }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ClusterConfig {
    pub discovery: DiscoveryConfig,
    pub health: HealthConfig,
    pub cache: CacheConfig,
    pub routing: RoutingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeSpec {
    pub id: String,
    pub base_url: String,
}

impl Default for NodeSpec {
    fn default() -> Self {
        Self { id: String::new(), base_url: String::new() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub mode: String,
    pub nodes: Vec<NodeSpec>,
    pub namespace: Option<String>,
    pub selector: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { mode: "static".to_string(), nodes: Vec::new(), namespace: None, selector: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_ms: u64,
    pub timeout_ms: u64,
    pub unhealthy_threshold: f64,
    pub max_consecutive_failures: u32,
    pub healthy_after_successes: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 10_000,
            timeout_ms: 3_000,
            unhealthy_threshold: 0.5,
            max_consecutive_failures: 3,
            healthy_after_successes: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_age_secs: u64,
    pub min_hit_rate: f64,
    pub max_cache_tokens: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_age_secs: 300, min_hit_rate: 0.1, max_cache_tokens: 50_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub strategy: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub sticky_ttl_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: "cache-aware".to_string(),
            max_retries: 2,
            retry_delay_ms: 250,
            sticky_ttl_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub retry_timeout_ms: u64,
    pub latency_threshold_ms: u64,
    pub latency_consecutive_checks: u32,
    pub latency_window_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            retry_timeout_ms: 30_000,
            latency_threshold_ms: 8_000,
            latency_consecutive_checks: 3,
            latency_window_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub default_tier: String,
    pub max_prompt_bytes: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self { default_tier: "moderate".to_string(), max_prompt_bytes: 64_000 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SearchConfig {
    pub searxng_url: Option<String>,
    pub public_fallback_enabled: bool,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolInjectionConfig {
    pub enabled: bool,
    pub style: String,
    pub confidence_threshold: f64,
    pub max_injections_per_conversation: u32,
}

impl Default for ToolInjectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            style: "subtle".to_string(),
            confidence_threshold: 0.6,
            max_injections_per_conversation: 1,
        }
    }
}

/// Command line overrides for the most operationally relevant fields.
#[derive(Parser, Debug, Clone)]
#[command(name = "claude-gateway-proxy")]
#[command(version, about = "Anthropic-compatible gateway proxy")]
pub struct CommandLineArgs {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Server host (overrides config file)
    #[arg(long, value_name = "HOST")]
    pub server_host: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Logging level (overrides config file, e.g., "info,gateway=debug")
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Cluster routing strategy (overrides config file)
    #[arg(long, value_name = "STRATEGY")]
    pub routing_strategy: Option<String>,

    /// Circuit breaker failure threshold (overrides config file)
    #[arg(long, value_name = "N")]
    pub circuit_failure_threshold: Option<u32>,

    /// Default prompt filter tier (overrides config file)
    #[arg(long, value_name = "TIER")]
    pub filter_default_tier: Option<String>,
}

impl Config {
    /// Load configuration with CLI, environment variable, and file support.
    ///
    /// Loading order (priority from highest to lowest):
    /// 1. Command line arguments
    /// 2. Environment variables (prefixed with GATEWAY_)
    /// 3. Configuration file (config.toml)
    /// 4. Default values
    pub fn load() -> Result<Self, anyhow::Error> {
        let _ = dotenvy::dotenv();
        let cli_args = CommandLineArgs::parse();

        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("configuration file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(&cli_args);
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides (prefix `GATEWAY_`).
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("GATEWAY_SERVER_HOST") {
            self.server.host = host;
            tracing::info!("override server.host from env: {}", self.server.host);
        }

        if let Ok(port) = std::env::var("GATEWAY_SERVER_PORT")
            && let Ok(port) = port.parse()
        {
            self.server.port = port;
            tracing::info!("override server.port from env: {}", self.server.port);
        }

        if let Ok(level) = std::env::var("GATEWAY_LOG_LEVEL") {
            self.logging.level = level;
            tracing::info!("override logging.level from env: {}", self.logging.level);
        }

        if let Ok(strategy) = std::env::var("GATEWAY_ROUTING_STRATEGY") {
            self.cluster.routing.strategy = strategy;
            tracing::info!(
                "override cluster.routing.strategy from env: {}",
                self.cluster.routing.strategy
            );
        }

        if let Ok(url) = std::env::var("SEARXNG_URL") {
            self.search.searxng_url = Some(url);
            tracing::info!("override search.searxng_url from env");
        }

        if let Ok(key) = std::env::var("GATEWAY_SEARCH_API_KEY") {
            self.search.api_key = Some(key);
            tracing::info!("override search.api_key from env");
        }
    }

    /// Apply command line argument overrides (highest priority).
    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(host) = &args.server_host {
            self.server.host = host.clone();
            tracing::info!("override server.host from CLI: {}", self.server.host);
        }

        if let Some(port) = args.server_port {
            self.server.port = port;
            tracing::info!("override server.port from CLI: {}", self.server.port);
        }

        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
            tracing::info!("override logging.level from CLI: {}", self.logging.level);
        }

        if let Some(strategy) = &args.routing_strategy {
            self.cluster.routing.strategy = strategy.clone();
            tracing::info!(
                "override cluster.routing.strategy from CLI: {}",
                self.cluster.routing.strategy
            );
        }

        if let Some(threshold) = args.circuit_failure_threshold {
            self.circuit_breaker.failure_threshold = threshold;
            tracing::info!(
                "override circuit_breaker.failure_threshold from CLI: {}",
                self.circuit_breaker.failure_threshold
            );
        }

        if let Some(tier) = &args.filter_default_tier {
            self.filter.default_tier = tier.clone();
            tracing::info!("override filter.default_tier from CLI: {}", self.filter.default_tier);
        }
    }

    /// Validate configuration, returning the error taxonomy from spec §7.
    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.server.port == 0 {
            return Err(ConfigError::invalid_config("server.port cannot be 0").into());
        }

        match self.cluster.discovery.mode.as_str() {
            "static" => {
                if self.cluster.discovery.nodes.is_empty() {
                    return Err(ConfigError::missing_nodes().into());
                }
                for node in &self.cluster.discovery.nodes {
                    if !node.base_url.starts_with("http://") && !node.base_url.starts_with("https://")
                    {
                        return Err(ConfigError::invalid_url(node.base_url.clone()).into());
                    }
                }
            },
            "external" => {},
            other => {
                return Err(ConfigError::invalid_config(format!(
                    "unknown discovery mode: {other}"
                ))
                .into());
            },
        }

        match self.cluster.routing.strategy.as_str() {
            "round-robin" | "least-loaded" | "cache-aware" | "latency-based" => {},
            other => return Err(ConfigError::invalid_strategy(other).into()),
        }

        match self.filter.default_tier.as_str() {
            "minimal" | "moderate" | "aggressive" | "extreme" => {},
            other => {
                return Err(ConfigError::invalid_config(format!(
                    "unknown filter tier: {other}"
                ))
                .into());
            },
        }

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid_config(
                "circuit_breaker.failure_threshold must be > 0",
            )
            .into());
        }

        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths = ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];
        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path).map_err(|e| {
            anyhow::Error::new(ConfigError::file_not_found(path)).context(e.to_string())
        })?;
        let mut value: toml::Value =
            toml::from_str(&content).map_err(|e| ConfigError::parse_error(e.to_string()))?;
        migrate_deprecated_keys(&mut value, path);
        let config: Config =
            value.try_into().map_err(|e: toml::de::Error| ConfigError::parse_error(e.to_string()))?;
        Ok(config)
    }
}

static WARNED_DEPRECATIONS: Lazy<Mutex<HashSet<&'static str>>> =
    Lazy::new(|| Mutex::new(HashSet::new()));

fn warn_once(key: &'static str, message: String) {
    let mut warned = WARNED_DEPRECATIONS.lock().expect("deprecation warn set poisoned");
    if warned.insert(key) {
        tracing::warn!("{}", message);
    }
}

/// One-time migration pass over the raw TOML table for renamed keys, run
/// before deserialization so old config files keep loading.
fn migrate_deprecated_keys(value: &mut toml::Value, path: &str) {
    if let Some(strategy) = value
        .get_mut("cluster")
        .and_then(|c| c.get_mut("routing"))
        .and_then(|r| r.get_mut("strategy"))
        && strategy.as_str() == Some("cache_affinity")
    {
        warn_once(
            "cache_affinity",
            format!(
                "{path}: [cluster.routing].strategy = \"cache_affinity\" is deprecated, use \"cache-aware\""
            ),
        );
        *strategy = toml::Value::String("cache-aware".to_string());
    }

    if let Some(breaker) = value.get_mut("circuit_breaker").and_then(|b| b.as_table_mut())
        && let Some(old) = breaker.remove("timeout_ms")
    {
        warn_once(
            "circuit_breaker.timeout_ms",
            format!("{path}: [circuit_breaker].timeout_ms is deprecated, use retry_timeout_ms"),
        );
        breaker.entry("retry_timeout_ms".to_string()).or_insert(old);
    }
}
