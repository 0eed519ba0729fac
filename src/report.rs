use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{WebClawError, WebClawResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Running,
    Success,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_index: u32,
    pub timestamp: String,
    pub url: String,
    /// File name relative to the report directory.
    pub screenshot: Option<String>,
    pub thought: String,
    pub plan: Option<String>,
    pub action: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub session_id: String,
    pub goal: String,
    pub status: ReportStatus,
    pub start_time: String,
    pub end_time: Option<String>,
    pub steps: Vec<StepRecord>,
}

/// Per-run report artifact: `<base>/<timestamp>_<slug>/report.json` plus one
/// JPEG per step. Rewritten in full after every change.
pub struct ReportManager {
    base_dir: PathBuf,
    current: Option<(PathBuf, RunReport)>,
}

impl ReportManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            current: None,
        }
    }

    pub fn start_session(&mut self, goal: &str) -> WebClawResult<PathBuf> {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let mut session_id = format!("{timestamp}_{}", slug(goal));
        if self.base_dir.join(&session_id).exists() {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            session_id = format!("{session_id}_{}", &suffix[..8]);
        }
        let dir = self.base_dir.join(&session_id);
        std::fs::create_dir_all(&dir)?;

        let report = RunReport {
            session_id: session_id.clone(),
            goal: goal.to_string(),
            status: ReportStatus::Running,
            start_time: chrono::Local::now().to_rfc3339(),
            end_time: None,
            steps: Vec::new(),
        };
        write_report(&dir, &report)?;
        tracing::info!(session = %session_id, dir = %dir.display(), "report session started");
        self.current = Some((dir.clone(), report));
        Ok(dir)
    }

    pub fn log_step(
        &mut self,
        step_index: u32,
        url: &str,
        thought: &str,
        plan: Option<&str>,
        action: serde_json::Value,
        screenshot: &[u8],
    ) -> WebClawResult<()> {
        let Some((dir, report)) = self.current.as_mut() else {
            return Err(WebClawError::Report("no report session in progress".into()));
        };

        let screenshot_file = if screenshot.is_empty() {
            None
        } else {
            let name = format!("step_{step_index}.jpg");
            match std::fs::write(dir.join(&name), screenshot) {
                Ok(()) => Some(name),
                Err(e) => {
                    tracing::warn!(error = %e, step = step_index, "failed to save step screenshot");
                    None
                }
            }
        };

        report.steps.push(StepRecord {
            step_index,
            timestamp: chrono::Local::now().to_rfc3339(),
            url: url.to_string(),
            screenshot: screenshot_file,
            thought: thought.to_string(),
            plan: plan.map(str::to_string),
            action,
        });
        write_report(dir, report)
    }

    pub fn end_session(&mut self, status: ReportStatus) -> WebClawResult<()> {
        let Some((dir, report)) = self.current.as_mut() else {
            return Err(WebClawError::Report("no report session in progress".into()));
        };
        report.status = status;
        report.end_time = Some(chrono::Local::now().to_rfc3339());
        write_report(dir, report)?;
        tracing::info!(session = %report.session_id, status = ?status, "report session ended");
        Ok(())
    }

    /// Path of the current run's `report.json`.
    pub fn location(&self) -> Option<PathBuf> {
        self.current.as_ref().map(|(dir, _)| dir.join("report.json"))
    }
}

fn write_report(dir: &Path, report: &RunReport) -> WebClawResult<()> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(dir.join("report.json"), json)?;
    tracing::debug!(dir = %dir.display(), steps = report.steps.len(), "report written");
    Ok(())
}

/// First 20 characters of the goal, non-alphanumerics replaced by `_`.
fn slug(goal: &str) -> String {
    goal.chars()
        .take(20)
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_is_filesystem_safe() {
        assert_eq!(slug("Buy milk, then pay!"), "Buy_milk__then_pay_");
        assert_eq!(slug("a very long goal that keeps going"), "a_very_long_goal_tha");
    }

    #[test]
    fn session_lifecycle_writes_json_and_screenshots() {
        let tmp = tempfile::tempdir().unwrap();
        let mut reports = ReportManager::new(tmp.path());
        assert!(reports.location().is_none());

        let dir = reports.start_session("find docs").unwrap();
        reports
            .log_step(
                1,
                "https://docs.test/",
                "search box visible",
                Some("search"),
                serde_json::json!({"type": "click", "target": "textbox \"Search\""}),
                &[0xFF, 0xD8, 0xFF],
            )
            .unwrap();
        reports.end_session(ReportStatus::Success).unwrap();

        let location = reports.location().unwrap();
        assert_eq!(location, dir.join("report.json"));
        let report: RunReport =
            serde_json::from_str(&std::fs::read_to_string(&location).unwrap()).unwrap();
        assert_eq!(report.goal, "find docs");
        assert_eq!(report.status, ReportStatus::Success);
        assert!(report.end_time.is_some());
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].screenshot.as_deref(), Some("step_1.jpg"));
        assert!(dir.join("step_1.jpg").exists());
    }

    #[test]
    fn logging_without_session_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut reports = ReportManager::new(tmp.path());
        assert!(matches!(
            reports.end_session(ReportStatus::Failed),
            Err(WebClawError::Report(_))
        ));
    }
}
