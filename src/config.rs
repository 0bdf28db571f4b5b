use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{PilotError, PilotResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub grounding: GroundingConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub annotator: AnnotatorConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub reflection: ReflectionConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    pub active_provider: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub providers: HashMap<String, ProviderEntry>,
    /// Role-to-model mapping. A missing role uses the active provider's default model.
    #[serde(default)]
    pub roles: RolesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub display_name: String,
    pub api_base: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Falls back to the env var SCREENPILOT_<ID>_API_KEY when absent.
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RolesConfig {
    /// Screenshot understanding: action proposals, verification, reflection.
    pub vision: Option<RoleEntry>,
    /// Text-only reasoning: task decomposition.
    pub reasoning: Option<RoleEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleEntry {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub stream: bool,
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Pause after each dispatched action before the verification capture.
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_true")]
    pub verify_each_step: bool,
    #[serde(default = "default_true")]
    pub enable_task_planning: bool,
    #[serde(default = "default_steps_per_subtask")]
    pub steps_per_subtask: u32,
    #[serde(default = "default_max_subtasks")]
    pub max_subtasks: usize,
    /// Stop after this many consecutive failed steps. None disables the check.
    #[serde(default)]
    pub max_consecutive_failures: Option<u32>,
    #[serde(default)]
    pub max_duration_minutes: Option<u32>,
    /// Optional directory for the JSONL session log.
    #[serde(default)]
    pub history_dir: Option<PathBuf>,
    /// Extra `*.toml` skill definitions loaded on top of the built-ins.
    #[serde(default)]
    pub skills_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            settle_delay_ms: default_settle_delay(),
            verify_each_step: true,
            enable_task_planning: true,
            steps_per_subtask: default_steps_per_subtask(),
            max_subtasks: default_max_subtasks(),
            max_consecutive_failures: None,
            max_duration_minutes: None,
            history_dir: None,
            skills_dir: None,
        }
    }
}

/// Scoring weights and thresholds for element grounding.
///
/// The defaults were calibrated by hand and are expected to be retuned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroundingConfig {
    pub name_weight: f64,
    pub value_weight: f64,
    pub text_weight: f64,
    pub type_bonus: f64,
    pub spatial_weight: f64,
    pub parent_weight: f64,
    /// Name/value/parent similarities at or below this add nothing.
    pub similarity_gate: f64,
    /// Spatial proximity at or below this adds nothing.
    pub spatial_gate: f64,
    /// Candidates at or below this score are discarded.
    pub min_candidate_score: f64,
    /// A best score below this triggers the spatial fallback.
    pub fallback_threshold: f64,
    pub fallback_radius: f64,
    pub fallback_runner_up_score: f64,
    pub max_runner_ups: usize,
    /// Confidence reported when a location comes from the element cache.
    pub cache_confidence: f64,
}

impl Default for GroundingConfig {
    fn default() -> Self {
        Self {
            name_weight: 0.5,
            value_weight: 0.3,
            text_weight: 0.4,
            type_bonus: 0.15,
            spatial_weight: 0.3,
            parent_weight: 0.1,
            similarity_gate: 0.5,
            spatial_gate: 0.7,
            min_candidate_score: 0.1,
            fallback_threshold: 0.3,
            fallback_radius: 150.0,
            fallback_runner_up_score: 0.5,
            max_runner_ups: 5,
            cache_confidence: 0.35,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// A page element overlapping an accessibility element at or above this IoU is dropped.
    pub iou_threshold: f64,
    pub use_accessibility: bool,
    pub use_page: bool,
    /// Accessibility trees younger than this are reused.
    pub tree_cache_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.5,
            use_accessibility: true,
            use_page: true,
            tree_cache_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotatorConfig {
    pub min_size: i32,
    pub max_marks: usize,
    pub outline_width: u32,
}

impl Default for AnnotatorConfig {
    fn default() -> Self {
        Self {
            min_size: 8,
            max_marks: 40,
            outline_width: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Recovery attempts allowed per step.
    pub max_attempts: u32,
    /// When non-empty, only strategies with these names are used.
    pub enabled_strategies: Vec<String>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            enabled_strategies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionConfig {
    pub max_retries: u32,
    /// Actions included in verification and reflection prompts.
    pub action_window: usize,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            action_window: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    /// Defaults to `<data dir>/screen-pilot/memory.json`.
    pub storage_path: Option<PathBuf>,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            storage_path: None,
            cache_ttl_secs: 300,
            cache_capacity: 100,
        }
    }
}

impl MemoryConfig {
    pub fn resolved_storage_path(&self) -> PathBuf {
        self.storage_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("screen-pilot")
                .join("memory.json")
        })
    }
}

fn default_temperature() -> f64 {
    0.1
}

fn default_request_timeout() -> u64 {
    60
}

fn default_max_steps() -> u32 {
    30
}

fn default_settle_delay() -> u64 {
    500
}

fn default_steps_per_subtask() -> u32 {
    20
}

fn default_max_subtasks() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn resolve_config_path() -> PilotResult<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(candidate);
            }
        }
    }

    let candidate = std::env::current_dir()?.join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(candidate);
    }

    Err(PilotError::Config(
        "config.toml not found next to executable or in working directory".into(),
    ))
}

/// Loads `config.toml` from an explicit path, or searches the default locations.
pub fn load_config(path: Option<&Path>) -> PilotResult<AppConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => resolve_config_path()?,
    };
    let content = std::fs::read_to_string(&path)?;
    let config = parse_config(&content)?;
    tracing::info!(
        path = %path.display(),
        provider = %config.llm.active_provider,
        max_steps = config.agent.max_steps,
        "config loaded"
    );
    Ok(config)
}

pub fn parse_config(content: &str) -> PilotResult<AppConfig> {
    Ok(toml::from_str(content)?)
}

pub fn save_config(config: &AppConfig, path: &Path) -> PilotResult<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    tracing::info!(path = %path.display(), "config saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.agent.max_steps, 30);
        assert_eq!(cfg.recovery.max_attempts, 3);
        assert_eq!(cfg.reflection.max_retries, 2);
        assert!((cfg.grounding.fallback_radius - 150.0).abs() < f64::EPSILON);
        assert_eq!(cfg.annotator.max_marks, 40);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = parse_config(
            r#"
            [llm]
            active_provider = "local"

            [llm.providers.local]
            display_name = "Local"
            api_base = "http://localhost:8000/v1"
            model = "qwen-vl"

            [grounding]
            name_weight = 0.6

            [agent]
            max_steps = 12
            "#,
        )
        .unwrap();
        assert_eq!(cfg.agent.max_steps, 12);
        assert!(cfg.agent.enable_task_planning);
        assert!((cfg.grounding.name_weight - 0.6).abs() < f64::EPSILON);
        assert!((cfg.grounding.type_bonus - 0.15).abs() < f64::EPSILON);
        let local = &cfg.llm.providers["local"];
        assert!((local.temperature - 0.1).abs() < f64::EPSILON);
        assert!(local.api_key.is_none());
    }

    #[test]
    fn save_then_load_from_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut cfg = AppConfig::default();
        cfg.agent.max_steps = 7;
        save_config(&cfg, &path).unwrap();
        let loaded = load_config(Some(&path)).unwrap();
        assert_eq!(loaded.agent.max_steps, 7);
    }
}
