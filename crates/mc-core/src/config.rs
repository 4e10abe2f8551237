use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};

/// Top-level configuration loaded from `~/.marcus/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub board: BoardConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub gridlock: GridlockConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Config {
    /// Load config from `~/.marcus/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reject configurations the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease.initial_ttl_secs == 0 {
            return Err(ConfigError::Invalid("lease.initial_ttl_secs must be > 0".into()));
        }
        if self.lease.hard_cap_secs < self.lease.initial_ttl_secs {
            return Err(ConfigError::Invalid(
                "lease.hard_cap_secs must be >= lease.initial_ttl_secs".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.inference.pattern_confidence_threshold)
            || !(0.0..=1.0).contains(&self.inference.ai_confidence_threshold)
        {
            return Err(ConfigError::Invalid("inference thresholds must be in [0, 1]".into()));
        }
        if self.gridlock.refusal_threshold == 0 {
            return Err(ConfigError::Invalid("gridlock.refusal_threshold must be > 0".into()));
        }
        Ok(())
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".marcus")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("invalid: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Feature<T> — legacy boolean values auto-upgrade to `{enabled: true}`
// ---------------------------------------------------------------------------

/// A feature toggle with per-feature options. Accepts either a bare boolean
/// (legacy form) or a table; `events = true` and `[features.events]` both
/// deserialize.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Feature<T> {
    pub enabled: bool,
    #[serde(flatten)]
    pub options: T,
}

impl<T: Default> Feature<T> {
    pub fn enabled() -> Self {
        Self { enabled: true, options: T::default() }
    }

    pub fn disabled() -> Self {
        Self { enabled: false, options: T::default() }
    }
}

impl<T: Default> Default for Feature<T> {
    fn default() -> Self {
        Self::enabled()
    }
}

impl<'de, T> Deserialize<'de> for Feature<T>
where
    T: Deserialize<'de> + Default,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw<T> {
            Flag(bool),
            Table {
                #[serde(default = "default_true")]
                enabled: bool,
                #[serde(flatten)]
                options: T,
            },
        }

        Ok(match Raw::<T>::deserialize(deserializer)? {
            Raw::Flag(enabled) => Feature { enabled, options: T::default() },
            Raw::Table { enabled, options } => Feature { enabled, options },
        })
    }
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `human` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            log_dir: default_log_dir(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "human".into()
}
fn default_log_dir() -> String {
    "logs".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// `file` or `sqlite`.
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_data_dir")]
    pub path: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_data_dir(),
        }
    }
}

fn default_backend() -> String {
    "file".into()
}
fn default_data_dir() -> String {
    "data/marcus_state".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardConfig {
    /// Kanban backend: `memory` or `planka`; further providers register by
    /// satisfying the `KanbanProvider` capability set.
    #[serde(default = "default_board_provider")]
    pub provider: String,
    #[serde(default = "default_board_url")]
    pub base_url: String,
    /// Environment variable holding the board API token.
    #[serde(default = "default_board_token_env")]
    pub token_env: String,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            provider: default_board_provider(),
            base_url: default_board_url(),
            token_env: default_board_token_env(),
        }
    }
}

fn default_board_provider() -> String {
    "memory".into()
}
fn default_board_url() -> String {
    "http://127.0.0.1:3000".into()
}
fn default_board_token_env() -> String {
    "MARCUS_BOARD_TOKEN".into()
}

// -- Features ---------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default)]
    pub events: Feature<EventsOptions>,
    #[serde(default)]
    pub context: Feature<ContextOptions>,
    #[serde(default)]
    pub memory: Feature<MemoryOptions>,
    #[serde(default)]
    pub decomposition: Feature<DecompositionOptions>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsOptions {
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Durable event log via the persistence layer.
    #[serde(default = "default_true")]
    pub persistence: bool,
}

impl Default for EventsOptions {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            persistence: true,
        }
    }
}

fn default_history_limit() -> usize {
    1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextOptions {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self { max_depth: default_max_depth() }
    }
}

fn default_max_depth() -> usize {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryOptions {
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            min_samples: default_min_samples(),
            decay_rate: default_decay_rate(),
        }
    }
}

fn default_min_samples() -> usize {
    5
}
fn default_decay_rate() -> f64 {
    0.1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecompositionOptions {
    #[serde(default = "default_min_hours")]
    pub min_hours: f64,
    #[serde(default = "default_max_subtasks")]
    pub max_subtasks: usize,
}

impl Default for DecompositionOptions {
    fn default() -> Self {
        Self {
            min_hours: default_min_hours(),
            max_subtasks: default_max_subtasks(),
        }
    }
}

fn default_min_hours() -> f64 {
    4.0
}
fn default_max_subtasks() -> usize {
    10
}

// -- Timeouts ---------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_board_ms")]
    pub board_ms: u64,
    #[serde(default = "default_decompose_ms")]
    pub ai_decompose_ms: u64,
    #[serde(default = "default_infer_ms")]
    pub ai_infer_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            board_ms: default_board_ms(),
            ai_decompose_ms: default_decompose_ms(),
            ai_infer_ms: default_infer_ms(),
        }
    }
}

fn default_board_ms() -> u64 {
    10_000
}
fn default_decompose_ms() -> u64 {
    30_000
}
fn default_infer_ms() -> u64 {
    15_000
}

// -- Lease ------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default = "default_initial_ttl")]
    pub initial_ttl_secs: u64,
    #[serde(default = "default_max_renewals")]
    pub max_renewals: u32,
    #[serde(default = "default_hard_cap")]
    pub hard_cap_secs: u64,
    #[serde(default = "default_lease_tick")]
    pub tick_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            initial_ttl_secs: default_initial_ttl(),
            max_renewals: default_max_renewals(),
            hard_cap_secs: default_hard_cap(),
            tick_secs: default_lease_tick(),
        }
    }
}

fn default_initial_ttl() -> u64 {
    30 * 60
}
fn default_max_renewals() -> u32 {
    8
}
fn default_hard_cap() -> u64 {
    4 * 60 * 60
}
fn default_lease_tick() -> u64 {
    30
}

// -- Gridlock ---------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridlockConfig {
    #[serde(default = "default_window")]
    pub window_secs: u64,
    #[serde(default = "default_refusal_threshold")]
    pub refusal_threshold: usize,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

impl Default for GridlockConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window(),
            refusal_threshold: default_refusal_threshold(),
            cooldown_secs: default_cooldown(),
        }
    }
}

fn default_window() -> u64 {
    5 * 60
}
fn default_refusal_threshold() -> usize {
    3
}
fn default_cooldown() -> u64 {
    10 * 60
}

// -- Scheduler --------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_w_priority")]
    pub w_priority: f64,
    #[serde(default = "default_w_age")]
    pub w_age: f64,
    #[serde(default = "default_w_fit")]
    pub w_fit: f64,
    #[serde(default = "default_w_success")]
    pub w_success: f64,
    #[serde(default = "default_w_estimate")]
    pub w_estimate: f64,
    /// Roles allowed to pull `destructive`-labeled tasks.
    #[serde(default = "default_destructive_roles")]
    pub destructive_allow_roles: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            w_priority: default_w_priority(),
            w_age: default_w_age(),
            w_fit: default_w_fit(),
            w_success: default_w_success(),
            w_estimate: default_w_estimate(),
            destructive_allow_roles: default_destructive_roles(),
        }
    }
}

fn default_w_priority() -> f64 {
    10.0
}
fn default_w_age() -> f64 {
    0.5
}
fn default_w_fit() -> f64 {
    5.0
}
fn default_w_success() -> f64 {
    3.0
}
fn default_w_estimate() -> f64 {
    0.25
}
fn default_destructive_roles() -> Vec<String> {
    vec!["admin".into(), "operator".into()]
}

// -- Inference --------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default = "default_pattern_threshold")]
    pub pattern_confidence_threshold: f64,
    #[serde(default = "default_ai_threshold")]
    pub ai_confidence_threshold: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            pattern_confidence_threshold: default_pattern_threshold(),
            ai_confidence_threshold: default_ai_threshold(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_pattern_threshold() -> f64 {
    0.80
}
fn default_ai_threshold() -> f64 {
    0.70
}
fn default_batch_size() -> usize {
    20
}

// -- Sync -------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
            retry_attempts: default_retry_attempts(),
        }
    }
}

fn default_sync_interval() -> u64 {
    300
}
fn default_retry_initial_ms() -> u64 {
    1_000
}
fn default_retry_max_ms() -> u64 {
    30_000
}
fn default_retry_attempts() -> u32 {
    3
}

// -- Agents -----------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Workers with no heartbeat within this window are invalidated.
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
    #[serde(default = "default_capacity")]
    pub default_capacity: u32,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl(),
            default_capacity: default_capacity(),
        }
    }
}

fn default_idle_ttl() -> u64 {
    15 * 60
}
fn default_capacity() -> u32 {
    1
}

// -- Daemon -----------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_host")]
    pub host: String,
    #[serde(default = "default_daemon_port")]
    pub port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_daemon_host(),
            port: default_daemon_port(),
        }
    }
}

fn default_daemon_host() -> String {
    "127.0.0.1".into()
}
fn default_daemon_port() -> u16 {
    4680
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_spec_values() {
        let cfg = Config::default();
        assert_eq!(cfg.lease.initial_ttl_secs, 1800);
        assert_eq!(cfg.lease.max_renewals, 8);
        assert_eq!(cfg.lease.hard_cap_secs, 14_400);
        assert_eq!(cfg.lease.tick_secs, 30);
        assert_eq!(cfg.gridlock.window_secs, 300);
        assert_eq!(cfg.gridlock.refusal_threshold, 3);
        assert_eq!(cfg.gridlock.cooldown_secs, 600);
        assert_eq!(cfg.inference.pattern_confidence_threshold, 0.80);
        assert_eq!(cfg.inference.ai_confidence_threshold, 0.70);
        assert_eq!(cfg.inference.batch_size, 20);
        assert_eq!(cfg.features.events.options.history_limit, 1000);
        assert_eq!(cfg.features.context.options.max_depth, 3);
        assert_eq!(cfg.features.memory.options.min_samples, 5);
        assert_eq!(cfg.features.decomposition.options.min_hours, 4.0);
        assert_eq!(cfg.timeouts.board_ms, 10_000);
        assert_eq!(cfg.timeouts.ai_decompose_ms, 30_000);
        assert_eq!(cfg.timeouts.ai_infer_ms, 15_000);
    }

    #[test]
    fn legacy_boolean_feature_upgrades() {
        let cfg: Config = toml::from_str(
            r#"
            [features]
            events = false
            memory = true
            "#,
        )
        .unwrap();
        assert!(!cfg.features.events.enabled);
        assert!(cfg.features.memory.enabled);
        // Options fall back to defaults in the legacy form.
        assert_eq!(cfg.features.events.options.history_limit, 1000);
        assert_eq!(cfg.features.memory.options.min_samples, 5);
    }

    #[test]
    fn table_feature_with_options() {
        let cfg: Config = toml::from_str(
            r#"
            [features.events]
            history_limit = 50
            persistence = false

            [features.context]
            max_depth = 5
            "#,
        )
        .unwrap();
        assert!(cfg.features.events.enabled);
        assert_eq!(cfg.features.events.options.history_limit, 50);
        assert!(!cfg.features.events.options.persistence);
        assert_eq!(cfg.features.context.options.max_depth, 5);
    }

    #[test]
    fn explicit_disabled_table() {
        let cfg: Config = toml::from_str(
            r#"
            [features.decomposition]
            enabled = false
            min_hours = 6.0
            "#,
        )
        .unwrap();
        assert!(!cfg.features.decomposition.enabled);
        assert_eq!(cfg.features.decomposition.options.min_hours, 6.0);
    }

    #[test]
    fn validate_rejects_zero_ttl() {
        let mut cfg = Config::default();
        cfg.lease.initial_ttl_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_threshold() {
        let mut cfg = Config::default();
        cfg.inference.ai_confidence_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = Config::default();
        let text = cfg.to_toml().unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.lease.initial_ttl_secs, cfg.lease.initial_ttl_secs);
        assert_eq!(back.daemon.port, cfg.daemon.port);
    }

    #[test]
    fn load_from_missing_file_is_error() {
        assert!(Config::load_from("/nonexistent/marcus.toml").is_err());
    }
}
