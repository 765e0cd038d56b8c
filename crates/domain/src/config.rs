//! Per-process runtime configuration, immutable after start.
//!
//! Loaded once from TOML at bootstrap. Every section has serde defaults so a
//! missing section means "use the shipped behavior", not an error.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ── serde default helpers ──────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_3() -> u32 {
    3
}
fn d_20() -> u32 {
    20
}
fn d_1000() -> u64 {
    1000
}
fn d_8000() -> u64 {
    8000
}
fn d_02() -> f64 {
    0.2
}
fn d_120() -> u64 {
    120
}
fn d_30() -> u64 {
    30
}
fn d_600() -> u64 {
    600
}
fn d_900() -> u64 {
    900
}
fn d_7200() -> u64 {
    7200
}
fn d_60() -> u64 {
    60
}
fn d_7() -> u32 {
    7
}
fn d_2() -> u32 {
    2
}
fn d_3600() -> u64 {
    3600
}
fn d_default_model() -> String {
    "openai/gpt-4o".into()
}
fn d_fast_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn d_temperature() -> f32 {
    0.2
}
fn d_sandbox_prefix() -> String {
    "spool-sbx-".into()
}
fn d_sandbox_image() -> String {
    "python:3.12-slim".into()
}
fn d_confirm_set() -> Vec<String> {
    vec!["run_shell".into(), "run_python".into(), "write_file".into()]
}
fn d_auto_approve() -> Vec<String> {
    vec!["read_*".into(), "list_*".into(), "grep_*".into(), "search_*".into()]
}

// ── Sections ───────────────────────────────────────────────────────

/// Model selection. Model specs are `provider/model` (e.g. `openai/gpt-4o`);
/// the provider half selects a credential and an endpoint, the model half
/// goes into the request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "d_default_model")]
    pub default_model: String,
    /// Cheap model used for thread titling.
    #[serde(default = "d_fast_model")]
    pub fast_model: String,
    #[serde(default = "d_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default_model: d_default_model(),
            fast_model: d_fast_model(),
            temperature: d_temperature(),
            max_tokens: None,
        }
    }
}

/// Bounded retry for transient provider failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "d_3")]
    pub attempts: u32,
    #[serde(default = "d_1000")]
    pub base_delay_ms: u64,
    #[serde(default = "d_8000")]
    pub max_delay_ms: u64,
    /// ±fraction of the delay added as jitter (0.2 = ±20%).
    #[serde(default = "d_02")]
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: d_3(),
            base_delay_ms: d_1000(),
            max_delay_ms: d_8000(),
            jitter_ratio: d_02(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "d_120")]
    pub model_secs: u64,
    #[serde(default = "d_30")]
    pub tool_secs: u64,
    /// Per-tool overrides (e.g. `run_shell = 300`).
    #[serde(default)]
    pub per_tool_secs: HashMap<String, u64>,
    #[serde(default = "d_600")]
    pub turn_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            model_secs: d_120(),
            tool_secs: d_30(),
            per_tool_secs: HashMap::new(),
            turn_secs: d_600(),
        }
    }
}

impl TimeoutsConfig {
    pub fn model(&self) -> Duration {
        Duration::from_secs(self.model_secs)
    }

    pub fn turn(&self) -> Duration {
        Duration::from_secs(self.turn_secs)
    }

    /// Effective budget for one tool call.
    pub fn tool(&self, tool_name: &str) -> Duration {
        let secs = self
            .per_tool_secs
            .get(tool_name)
            .copied()
            .unwrap_or(self.tool_secs);
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "d_900")]
    pub idle_timeout_secs: u64,
    #[serde(default = "d_7200")]
    pub max_duration_secs: u64,
    #[serde(default = "d_2")]
    pub max_per_user: u32,
    #[serde(default = "d_60")]
    pub reaper_interval_secs: u64,
    #[serde(default = "d_30")]
    pub boot_timeout_secs: u64,
    /// Container name prefix; the orphan sweep only ever touches names that
    /// start with this exact string.
    #[serde(default = "d_sandbox_prefix")]
    pub name_prefix: String,
    #[serde(default = "d_sandbox_image")]
    pub image: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: d_900(),
            max_duration_secs: d_7200(),
            max_per_user: d_2(),
            reaper_interval_secs: d_60(),
            boot_timeout_secs: d_30(),
            name_prefix: d_sandbox_prefix(),
            image: d_sandbox_image(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "d_7")]
    pub retention_days: u32,
    #[serde(default = "d_3")]
    pub min_retained_per_thread: u32,
    #[serde(default = "d_3600")]
    pub sweep_interval_secs: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            retention_days: d_7(),
            min_retained_per_thread: d_3(),
            sweep_interval_secs: d_3600(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnonymousConfig {
    /// Anonymous threads idle longer than this are deleted by the sweep.
    #[serde(default = "d_7")]
    pub ttl_days: u32,
}

impl Default for AnonymousConfig {
    fn default() -> Self {
        Self { ttl_days: d_7() }
    }
}

/// Human-in-the-loop gating.
///
/// A call needs confirmation when its tool is in the confirmation set AND
/// does not match any auto-approve glob (`read_*`, `search_*`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default = "d_confirm_set")]
    pub require_confirmation: Vec<String>,
    #[serde(default = "d_auto_approve")]
    pub auto_approve: Vec<String>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            require_confirmation: d_confirm_set(),
            auto_approve: d_auto_approve(),
        }
    }
}

impl ApprovalConfig {
    pub fn requires_confirmation(&self, tool_name: &str) -> bool {
        if !self.require_confirmation.iter().any(|n| n == tool_name) {
            return false;
        }
        !self.auto_approve.iter().any(|pat| {
            glob::Pattern::new(pat)
                .map(|p| p.matches(tool_name))
                .unwrap_or(false)
        })
    }
}

/// Default daily request caps applied when a user has no ledger row yet.
/// `None` means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaDefaults {
    #[serde(default)]
    pub daily_text_requests: Option<u32>,
    #[serde(default)]
    pub daily_image_requests: Option<u32>,
    #[serde(default)]
    pub daily_embedding_requests: Option<u32>,
    #[serde(default)]
    pub monthly_token_limit: Option<u64>,
}

/// System-wide credential for one provider (the fallback when a user has no
/// key of their own).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
}

/// Per-model pricing used for cost estimates in the usage log.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelPricing {
    #[serde(default)]
    pub input_per_1k: f64,
    #[serde(default)]
    pub output_per_1k: f64,
}

impl ModelPricing {
    pub fn estimate_cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

// ── Root ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub anonymous: AnonymousConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub quota: QuotaDefaults,
    /// Keyed by provider id (`openai`, `dashscope`, ...).
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
    /// Keyed by model name.
    #[serde(default)]
    pub pricing: HashMap<String, ModelPricing>,
    #[serde(default = "d_20")]
    pub max_iterations: u32,
    /// Whether model responses stream token deltas to the caller.
    #[serde(default = "d_true")]
    pub streaming: bool,
    /// Whether first turns trigger fast-model title generation.
    #[serde(default = "d_true")]
    pub auto_title: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            models: ModelsConfig::default(),
            retry: RetryConfig::default(),
            timeouts: TimeoutsConfig::default(),
            sandbox: SandboxConfig::default(),
            checkpoint: CheckpointConfig::default(),
            anonymous: AnonymousConfig::default(),
            approval: ApprovalConfig::default(),
            quota: QuotaDefaults::default(),
            providers: HashMap::new(),
            pricing: HashMap::new(),
            max_iterations: d_20(),
            streaming: true,
            auto_title: true,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Split a `provider/model` spec. A bare name is treated as a model on
    /// the default provider `openai`.
    pub fn split_model_spec(spec: &str) -> (&str, &str) {
        match spec.split_once('/') {
            Some((provider, model)) => (provider, model),
            None => ("openai", spec),
        }
    }

    pub fn system_key(&self, provider: &str) -> Option<&ProviderSettings> {
        self.providers
            .get(provider)
            .filter(|s| s.api_key.is_some())
    }
}
