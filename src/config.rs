use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{WebClawError, WebClawResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub perception: PerceptionConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    pub active_provider: String,
    #[serde(default)]
    pub providers: HashMap<String, ProviderEntry>,
    /// Tier-to-model mapping. If a tier is absent, falls back to active_provider defaults.
    #[serde(default)]
    pub roles: RolesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub display_name: String,
    pub api_base: String,
    /// Default model for this provider (used as fallback when no role config exists).
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Optional API key stored in config.toml (falls back to env var WEBCLAW_<ID>_API_KEY).
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Maps the two routing tiers to specific provider+model combinations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RolesConfig {
    /// Higher-capability model: first cycle, after failures, after a stuck flag.
    pub reasoning: Option<RoleEntry>,
    /// Faster/cheaper model for routine cycles.
    pub fast: Option<RoleEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleEntry {
    /// Must match a key under [llm.providers.*].
    pub provider: String,
    /// Model name sent to the API.
    pub model: String,
    /// Use SSE streaming.
    #[serde(default)]
    pub stream: bool,
    /// Overrides the provider-level temperature for this role.
    pub temperature: Option<f64>,
}

fn default_temperature() -> f64 {
    0.1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Hard cap on Sense-Think-Act cycles per run.
    pub max_steps: u32,
    /// How many past (decision, outcome) pairs are kept and shown to the model.
    pub history_window: usize,
    /// Identical consecutive progress tuples that count as a loop.
    pub loop_repeat_threshold: u32,
    /// Self-correction hints allowed per run before loop protection fails it.
    pub max_self_corrections: u32,
    /// Corrective re-requests after a schema violation.
    pub invalid_decision_retries: u32,
    pub max_consecutive_failures: u32,
    /// 0 disables the time budget.
    pub max_run_minutes: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 30,
            history_window: 8,
            loop_repeat_threshold: 3,
            max_self_corrections: 1,
            invalid_decision_retries: 1,
            max_consecutive_failures: 5,
            max_run_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerceptionConfig {
    /// Bounded wait for the page to settle before a snapshot is taken.
    pub settle_timeout_ms: u64,
    pub max_prompt_nodes: usize,
    pub max_prompt_events: usize,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            settle_timeout_ms: 3000,
            max_prompt_nodes: 150,
            max_prompt_events: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub quiescence_timeout_ms: u64,
    pub click_hold_ms: u64,
    pub keystroke_delay_ms: u64,
    pub scroll_step_px: f64,
    pub default_wait_ms: u64,
    pub max_wait_ms: u64,
    pub highlight_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            quiescence_timeout_ms: 5000,
            click_hold_ms: 40,
            keystroke_delay_ms: 25,
            scroll_step_px: 500.0,
            default_wait_ms: 1000,
            max_wait_ms: 10_000,
            highlight_ms: 1500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,
    pub executable: Option<PathBuf>,
    pub window_width: u32,
    pub window_height: u32,
    pub start_url: String,
    /// No in-flight requests for this long counts as network quiescence.
    pub quiet_window_ms: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: false,
            executable: None,
            window_width: 1280,
            window_height: 720,
            start_url: "about:blank".into(),
            quiet_window_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
        }
    }
}

impl ReportConfig {
    /// Configured directory, else `<data dir>/webclaw/reports`, else `./reports`.
    pub fn resolved_dir(&self) -> PathBuf {
        if let Some(dir) = &self.dir {
            return dir.clone();
        }
        dirs::data_local_dir()
            .map(|d| d.join("webclaw").join("reports"))
            .unwrap_or_else(|| PathBuf::from("reports"))
    }
}

fn resolve_config_path() -> WebClawResult<PathBuf> {
    if let Ok(explicit) = std::env::var("WEBCLAW_CONFIG") {
        let candidate = PathBuf::from(explicit);
        if candidate.exists() {
            tracing::debug!(path = %candidate.display(), "config taken from WEBCLAW_CONFIG");
            return Ok(candidate);
        }
        return Err(WebClawError::Config(format!(
            "WEBCLAW_CONFIG points to missing file {}",
            candidate.display()
        )));
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(candidate);
            }
        }
    }

    let cwd = std::env::current_dir()?;
    let candidate = cwd.join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(candidate);
    }

    Err(WebClawError::Config(
        "config.toml not found next to executable or in working directory".into(),
    ))
}

pub fn parse_config(content: &str) -> WebClawResult<AppConfig> {
    Ok(toml::from_str(content)?)
}

pub fn load_config() -> WebClawResult<AppConfig> {
    let path = resolve_config_path()?;
    let content = std::fs::read_to_string(&path)?;
    let config = parse_config(&content)?;
    tracing::info!(path = %path.display(), provider = %config.llm.active_provider, "config loaded");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.agent.max_steps, 30);
        assert_eq!(cfg.agent.loop_repeat_threshold, 3);
        assert_eq!(cfg.agent.invalid_decision_retries, 1);
        assert!(cfg.report.enabled);
        assert!(cfg.llm.roles.reasoning.is_none());
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let cfg = parse_config(
            r#"
            [llm]
            active_provider = "gemini"

            [llm.providers.gemini]
            display_name = "Gemini"
            api_base = "https://example.invalid/v1/chat/completions"
            model = "gemini-2.5-flash"

            [llm.roles.reasoning]
            provider = "gemini"
            model = "gemini-2.5-pro"

            [agent]
            max_steps = 12
            "#,
        )
        .unwrap();

        assert_eq!(cfg.agent.max_steps, 12);
        assert_eq!(cfg.agent.history_window, 8);
        let gemini = &cfg.llm.providers["gemini"];
        assert!((gemini.temperature - 0.1).abs() < f64::EPSILON);
        let reasoning = cfg.llm.roles.reasoning.as_ref().unwrap();
        assert_eq!(reasoning.model, "gemini-2.5-pro");
        assert!(!reasoning.stream);
    }

    #[test]
    fn explicit_report_dir_wins() {
        let report = ReportConfig {
            enabled: true,
            dir: Some(PathBuf::from("/tmp/webclaw-reports")),
        };
        assert_eq!(report.resolved_dir(), PathBuf::from("/tmp/webclaw-reports"));
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = AppConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back = parse_config(&text).unwrap();
        assert_eq!(back.executor.quiescence_timeout_ms, cfg.executor.quiescence_timeout_ms);
    }
}
