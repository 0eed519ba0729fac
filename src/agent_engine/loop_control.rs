// Safety policies: loop detection with one-shot self-correction, failure streaks,
// time and step budgets.
use std::fmt;
use std::time::{Duration, Instant};

use crate::agent_engine::state::DecisionKey;
use crate::config::AgentConfig;

/// What loop detection compares: the semantic decision plus where it left the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressKey {
    pub decision: DecisionKey,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    LoopProtection,
    StepBudget,
    TooManyFailures,
    TimeBudget,
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailReason::LoopProtection => "loop protection",
            FailReason::StepBudget => "step budget exceeded",
            FailReason::TooManyFailures => "too many consecutive failures",
            FailReason::TimeBudget => "time budget exceeded",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    /// A hint will accompany the next decision request.
    SelfCorrect { hint: String },
    Fail(FailReason),
}

pub struct LoopController {
    max_steps: u32,
    repeat_threshold: u32,
    max_self_corrections: u32,
    max_consecutive_failures: u32,
    max_duration: Option<Duration>,
    start_time: Instant,
    cycles: u32,
    consecutive_failures: u32,
    streak: Option<(ProgressKey, u32)>,
    /// Decision the pending hint is about.
    flagged: Option<DecisionKey>,
    corrections_used: u32,
}

impl LoopController {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            max_steps: config.max_steps,
            repeat_threshold: config.loop_repeat_threshold.max(1),
            max_self_corrections: config.max_self_corrections,
            max_consecutive_failures: config.max_consecutive_failures,
            max_duration: (config.max_run_minutes > 0)
                .then(|| Duration::from_secs(u64::from(config.max_run_minutes) * 60)),
            start_time: Instant::now(),
            cycles: 0,
            consecutive_failures: 0,
            streak: None,
            flagged: None,
            corrections_used: 0,
        }
    }

    /// Starts a new cycle and returns its 1-based index.
    pub fn begin_cycle(&mut self) -> u32 {
        self.cycles += 1;
        self.cycles
    }

    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    /// True while a self-correction hint is waiting to be answered.
    pub fn is_flagged(&self) -> bool {
        self.flagged.is_some()
    }

    pub fn correction_hint(&self) -> Option<String> {
        self.flagged.as_ref().map(hint_for)
    }

    /// Called with every fresh decision. Repeating the flagged decision right
    /// after the hint fails the run; anything else consumes the hint.
    pub fn check_decision(&mut self, key: &DecisionKey) -> Result<(), FailReason> {
        if let Some(flagged) = self.flagged.take() {
            if flagged == *key {
                tracing::warn!(decision = %key, "decision repeated after self-correction hint");
                return Err(FailReason::LoopProtection);
            }
            tracing::info!(previous = %flagged, now = %key, "self-correction changed approach");
        }
        Ok(())
    }

    pub fn record_outcome(&mut self, progress: ProgressKey, failed: bool) -> Verdict {
        if failed {
            self.consecutive_failures += 1;
        } else {
            self.consecutive_failures = 0;
        }

        let count = match self.streak.take() {
            Some((key, count)) if key == progress => count + 1,
            _ => 1,
        };
        self.streak = Some((progress.clone(), count));

        let mut verdict = Verdict::Continue;
        if count >= self.repeat_threshold {
            tracing::warn!(decision = %progress.decision, url = %progress.url, count, "loop detected");
            self.streak = None;
            verdict = match self.flag(progress.decision) {
                Ok(hint) => Verdict::SelfCorrect { hint },
                Err(reason) => return Verdict::Fail(reason),
            };
        }

        match self.exceeded_limit() {
            Some(reason) => Verdict::Fail(reason),
            None => verdict,
        }
    }

    /// The model declared itself stuck.
    pub fn record_stuck(&mut self, key: DecisionKey) -> Verdict {
        self.streak = None;
        let verdict = match self.flag(key) {
            Ok(hint) => Verdict::SelfCorrect { hint },
            Err(reason) => return Verdict::Fail(reason),
        };
        match self.exceeded_limit() {
            Some(reason) => Verdict::Fail(reason),
            None => verdict,
        }
    }

    /// A cycle failed before producing an outcome (backend or capture error).
    pub fn record_failure(&mut self) -> Verdict {
        self.consecutive_failures += 1;
        match self.exceeded_limit() {
            Some(reason) => Verdict::Fail(reason),
            None => Verdict::Continue,
        }
    }

    fn flag(&mut self, key: DecisionKey) -> Result<String, FailReason> {
        if self.corrections_used >= self.max_self_corrections {
            return Err(FailReason::LoopProtection);
        }
        self.corrections_used += 1;
        let hint = hint_for(&key);
        self.flagged = Some(key);
        Ok(hint)
    }

    fn exceeded_limit(&self) -> Option<FailReason> {
        if self.max_consecutive_failures > 0
            && self.consecutive_failures >= self.max_consecutive_failures
        {
            return Some(FailReason::TooManyFailures);
        }
        if let Some(max) = self.max_duration {
            if self.start_time.elapsed() >= max {
                return Some(FailReason::TimeBudget);
            }
        }
        if self.cycles >= self.max_steps {
            return Some(FailReason::StepBudget);
        }
        None
    }
}

fn hint_for(key: &DecisionKey) -> String {
    format!(
        "You are repeating yourself: \"{key}\" has not made progress. \
         Try a different approach (another element, scrolling, navigating, or searching)."
    )
}
