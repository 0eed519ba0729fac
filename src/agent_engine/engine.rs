use std::future::Future;
use std::sync::Arc;

use base64::Engine as _;
use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::agent_engine::decision::{route, DecisionEngine};
use crate::agent_engine::event_bus::{Emitter, OutboundEvent, EXECUTION_INTERRUPTED, GOAL_ACHIEVED};
use crate::agent_engine::history::{HistoryEntry, RunHistory};
use crate::agent_engine::loop_control::{LoopController, ProgressKey, Verdict};
use crate::agent_engine::state::{Action, AgentEvent, Decision, DecisionRecord, Goal, RunState};
use crate::config::{AgentConfig, AppConfig};
use crate::executor::dispatcher::ActionExecutor;
use crate::llm::registry::ProviderRegistry;
use crate::perception::pipeline::Perceiver;
use crate::perception::traits::BrowserSession;
use crate::perception::types::Snapshot;
use crate::report::{ReportManager, ReportStatus};

#[derive(Debug)]
enum RunEnd {
    Achieved(String),
    Failed(String),
    Interrupted,
}

/// How a run ended, returned to the caller of [`AgentEngine::run_goal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub state: RunState,
    pub cycles: u32,
    /// The terminal message that was emitted.
    pub message: String,
}

pub struct AgentEngine {
    state: RunState,
    event_rx: mpsc::Receiver<AgentEvent>,
    emitter: Emitter,
    session: Arc<dyn BrowserSession>,
    perceiver: Perceiver,
    decider: DecisionEngine,
    executor: ActionExecutor,
    agent_config: AgentConfig,
    reports: Option<ReportManager>,
    shutdown: bool,
}

impl AgentEngine {
    pub fn new(
        session: Arc<dyn BrowserSession>,
        registry: Arc<ProviderRegistry>,
        config: &AppConfig,
        event_rx: mpsc::Receiver<AgentEvent>,
        emitter: Emitter,
    ) -> Self {
        Self {
            state: RunState::Idle,
            event_rx,
            emitter,
            session,
            perceiver: Perceiver::new(config.perception.clone()),
            decider: DecisionEngine::new(
                registry,
                &config.agent,
                config.perception.clone(),
                config.executor.clone(),
            ),
            executor: ActionExecutor::new(config.executor.clone()),
            agent_config: config.agent.clone(),
            reports: None,
            shutdown: false,
        }
    }

    pub fn with_reports(mut self, reports: ReportManager) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Idle loop: one run per received goal, until shutdown or the command
    /// channel closes.
    pub async fn run_loop(&mut self) {
        while !self.shutdown {
            match self.event_rx.recv().await {
                Some(AgentEvent::GoalReceived(goal)) => {
                    let summary = self.run_goal(goal).await;
                    tracing::info!(
                        state = %summary.state,
                        cycles = summary.cycles,
                        message = %summary.message,
                        "run finished"
                    );
                }
                Some(AgentEvent::Shutdown) | None => break,
                Some(other) => tracing::debug!(?other, "ignored while idle"),
            }
        }
        tracing::info!("agent loop ended");
    }

    pub async fn run_goal(&mut self, goal: Goal) -> RunSummary {
        self.state = RunState::Idle;
        self.set_state(RunState::Running);
        tracing::info!(goal = %goal, step_by_step = goal.step_by_step(), "goal received");
        self.emitter.log(format!("Orchestrating goal: {goal}"));
        self.start_report(&goal);

        let mut history = RunHistory::new(self.agent_config.history_window);
        let mut loop_ctrl = LoopController::new(&self.agent_config);
        let mut last_failed = false;

        let end = loop {
            // ── Stop requested between cycles ─────────────────────────────
            if self.stop_requested() {
                break RunEnd::Interrupted;
            }

            let cycle = loop_ctrl.begin_cycle();
            tracing::info!(run = %history.run_id, cycle, "cycle started");

            // ── Sense ─────────────────────────────────────────────────────
            let captured = interruptible(
                &mut self.event_rx,
                &mut self.shutdown,
                self.perceiver.capture(self.session.as_ref()),
            )
            .await;
            let snapshot = match captured {
                None => break RunEnd::Interrupted,
                Some(Ok(snapshot)) => snapshot,
                Some(Err(e)) if e.is_fatal() => break RunEnd::Failed(e.to_string()),
                Some(Err(e)) => {
                    tracing::warn!(error = %e, cycle, "capture failed");
                    self.emitter.protocol(format!("Perception failed: {e}"));
                    last_failed = true;
                    match loop_ctrl.record_failure() {
                        Verdict::Fail(reason) => break RunEnd::Failed(reason.to_string()),
                        _ => continue,
                    }
                }
            };
            self.emit_state(&snapshot);

            // ── Think ─────────────────────────────────────────────────────
            let tier = route(cycle, last_failed, loop_ctrl.is_flagged());
            let hint = loop_ctrl.correction_hint();
            self.emitter.log("Thinking...");
            let decided = interruptible(
                &mut self.event_rx,
                &mut self.shutdown,
                self.decider
                    .decide(&goal, &snapshot, &history, hint.as_deref(), tier),
            )
            .await;
            let decided = match decided {
                None => break RunEnd::Interrupted,
                Some(Ok(decided)) => decided,
                Some(Err(e)) if e.is_fatal() => break RunEnd::Failed(e.to_string()),
                Some(Err(e)) => {
                    tracing::warn!(error = %e, cycle, "decision backend failed");
                    self.emitter.protocol(format!("Decision backend error: {e}"));
                    last_failed = true;
                    match loop_ctrl.record_failure() {
                        Verdict::Fail(reason) => break RunEnd::Failed(reason.to_string()),
                        _ => continue,
                    }
                }
            };

            self.emitter.emit(OutboundEvent::Thought {
                model: format!("{} ({})", decided.tier.role_name(), decided.model),
                thought: decided.decision.rationale.clone(),
            });
            if let Some(plan) = &decided.decision.plan {
                tracing::info!(plan = %plan, "current plan");
            }
            let decision = decided.decision;
            let key = decision.key(&snapshot);

            if let Err(reason) = loop_ctrl.check_decision(&key) {
                break RunEnd::Failed(reason.to_string());
            }
            self.log_report_step(cycle, &snapshot, &decision);

            match &decision.action {
                Action::Done { summary } => {
                    tracing::info!(summary = %summary, "goal reported achieved");
                    break RunEnd::Achieved(summary.clone());
                }
                Action::Stuck { reason } => {
                    tracing::warn!(reason = %reason, "model reports it is stuck");
                    self.emitter.protocol(format!("Agent is stuck: {reason}"));
                    last_failed = true;
                    match loop_ctrl.record_stuck(key) {
                        Verdict::Fail(fail) => break RunEnd::Failed(format!("{fail}: {reason}")),
                        Verdict::SelfCorrect { hint } => {
                            self.emitter.log(format!("Self-correcting: {hint}"));
                            continue;
                        }
                        Verdict::Continue => continue,
                    }
                }
                _ => {}
            }

            // ── Step-by-step approval ─────────────────────────────────────
            if goal.step_by_step() && !self.await_approval(&decision).await {
                break RunEnd::Interrupted;
            }

            // A stop that raced the backend call wins over dispatch.
            if self.stop_requested() {
                break RunEnd::Interrupted;
            }

            // ── Act ───────────────────────────────────────────────────────
            self.emitter.log(format!("Executing: {}", decision.describe()));
            let dispatch = self.executor.dispatch(self.session.as_ref(), &snapshot, &decision);
            // Input sequences run to completion; a wait is just a sleep.
            let dispatched = if matches!(decision.action, Action::Wait { .. }) {
                interruptible(&mut self.event_rx, &mut self.shutdown, dispatch).await
            } else {
                Some(dispatch.await)
            };
            let outcome = match dispatched {
                None => break RunEnd::Interrupted,
                Some(Err(e)) => break RunEnd::Failed(e.to_string()),
                Some(Ok(outcome)) if outcome.is_failure() => outcome,
                Some(Ok(_)) => {
                    let settled = interruptible(
                        &mut self.event_rx,
                        &mut self.shutdown,
                        self.executor.settle(self.session.as_ref()),
                    )
                    .await;
                    match settled {
                        None => break RunEnd::Interrupted,
                        Some(Ok(outcome)) => outcome,
                        Some(Err(e)) => break RunEnd::Failed(e.to_string()),
                    }
                }
            };
            if outcome.is_failure() {
                self.emitter
                    .protocol(format!("Action {} failed: {outcome}", decision.action.kind()));
            }

            let url_after = match self.session.current_url().await {
                Ok(url) => url,
                Err(e) if e.is_fatal() => break RunEnd::Failed(e.to_string()),
                Err(_) => snapshot.url.clone(),
            };
            let failed = outcome.is_failure();
            history.push(HistoryEntry {
                ts: chrono::Utc::now().timestamp_millis(),
                cycle,
                snapshot: snapshot.summary(),
                decision: DecisionRecord::from_decision(decision, &snapshot),
                outcome,
                url_after: url_after.clone(),
            });
            last_failed = failed;

            if self.stop_requested() {
                break RunEnd::Interrupted;
            }

            match loop_ctrl.record_outcome(ProgressKey { decision: key, url: url_after }, failed) {
                Verdict::Continue => {}
                Verdict::SelfCorrect { hint } => {
                    self.emitter.log(format!("Loop detected, self-correcting: {hint}"));
                }
                Verdict::Fail(reason) => break RunEnd::Failed(reason.to_string()),
            }
        };

        let cycles = loop_ctrl.cycles();
        self.finish(end, cycles)
    }

    fn finish(&mut self, end: RunEnd, cycles: u32) -> RunSummary {
        let (status, event) = match end {
            RunEnd::Achieved(summary) => {
                self.set_state(RunState::Completed);
                if !summary.is_empty() {
                    self.emitter.log(format!("Summary: {summary}"));
                }
                (
                    ReportStatus::Success,
                    OutboundEvent::Success {
                        message: GOAL_ACHIEVED.into(),
                    },
                )
            }
            RunEnd::Failed(reason) => {
                tracing::warn!(reason = %reason, cycles, "run failed");
                self.set_state(RunState::Failed);
                (
                    ReportStatus::Failed,
                    OutboundEvent::Error {
                        message: format!("Agent stopped: {reason}"),
                    },
                )
            }
            RunEnd::Interrupted => {
                tracing::info!(cycles, "run interrupted");
                self.set_state(RunState::Stopping);
                self.set_state(RunState::Failed);
                (
                    ReportStatus::Stopped,
                    OutboundEvent::Error {
                        message: EXECUTION_INTERRUPTED.into(),
                    },
                )
            }
        };

        self.end_report(status);
        let message = match &event {
            OutboundEvent::Success { message } | OutboundEvent::Error { message } => message.clone(),
            _ => String::new(),
        };
        self.emitter.emit(event);

        RunSummary {
            state: self.state,
            cycles,
            message,
        }
    }

    fn set_state(&mut self, to: RunState) {
        match self.state.transition(to) {
            Ok(next) => self.state = next,
            Err(e) => tracing::error!(error = %e, "run state unchanged"),
        }
    }

    /// Non-blocking check of the control channel. Shutdown only marks the
    /// engine to exit once the current run is over.
    fn stop_requested(&mut self) -> bool {
        loop {
            match self.event_rx.try_recv() {
                Ok(AgentEvent::Stop) => {
                    tracing::info!("stop requested");
                    return true;
                }
                Ok(AgentEvent::Shutdown) | Err(TryRecvError::Disconnected) => {
                    if !self.shutdown {
                        tracing::info!("shutdown requested; finishing current run");
                    }
                    self.shutdown = true;
                    return false;
                }
                Ok(other) => tracing::warn!(?other, "control event ignored while running"),
                Err(TryRecvError::Empty) => return false,
            }
        }
    }

    /// Blocks until the step is approved (`true`) or the run is stopped.
    /// Nobody can approve once the channel is shut down, so that stops too.
    async fn await_approval(&mut self, decision: &Decision) -> bool {
        self.set_state(RunState::Paused);
        self.emitter.emit(OutboundEvent::Pause {
            message: format!("Next step: {}. Waiting for approval.", decision.describe()),
            rationale: decision.rationale.clone(),
        });
        loop {
            match self.event_rx.recv().await {
                Some(AgentEvent::Resume) => {
                    tracing::info!("step approved");
                    self.set_state(RunState::Running);
                    return true;
                }
                Some(AgentEvent::Stop) => return false,
                Some(AgentEvent::Shutdown) | None => {
                    self.shutdown = true;
                    return false;
                }
                Some(other) => tracing::warn!(?other, "control event ignored while paused"),
            }
        }
    }

    fn emit_state(&self, snapshot: &Snapshot) {
        self.emitter.emit(OutboundEvent::State {
            screenshot: base64::engine::general_purpose::STANDARD.encode(&snapshot.image),
            url: snapshot.url.clone(),
            events: snapshot.event_lines(),
        });
    }

    // ── Reports (best effort) ────────────────────────────────────────────────

    fn start_report(&mut self, goal: &Goal) {
        if let Some(reports) = self.reports.as_mut() {
            if let Err(e) = reports.start_session(goal.text()) {
                tracing::warn!(error = %e, "report session could not be started");
            }
        }
    }

    fn log_report_step(&mut self, cycle: u32, snapshot: &Snapshot, decision: &Decision) {
        let Some(reports) = self.reports.as_mut() else {
            return;
        };
        let action = serde_json::json!({
            "type": decision.action.kind(),
            "target": decision
                .action
                .target()
                .and_then(|t| snapshot.node(t))
                .map(|n| format!("{} \"{}\"", n.role, n.name)),
            "value": decision.action.value(),
            "description": decision.description,
        });
        if let Err(e) = reports.log_step(
            cycle,
            &snapshot.url,
            &decision.rationale,
            decision.plan.as_deref(),
            action,
            &snapshot.image,
        ) {
            tracing::warn!(error = %e, cycle, "report step not written");
        }
    }

    fn end_report(&mut self, status: ReportStatus) {
        let Some(reports) = self.reports.as_mut() else {
            return;
        };
        match reports.end_session(status) {
            Ok(()) => {
                if let Some(location) = reports.location() {
                    self.emitter.emit(OutboundEvent::Report {
                        location: location.display().to_string(),
                    });
                }
            }
            Err(e) => tracing::warn!(error = %e, "report not finalised"),
        }
    }
}

/// Runs `fut` while watching the control channel; `None` if a stop won the
/// race. A shutdown or closed channel is noted and `fut` keeps running.
async fn interruptible<F: Future>(
    rx: &mut mpsc::Receiver<AgentEvent>,
    shutdown: &mut bool,
    fut: F,
) -> Option<F::Output> {
    tokio::pin!(fut);
    let mut open = true;
    loop {
        tokio::select! {
            biased;
            event = rx.recv(), if open => match event {
                Some(AgentEvent::Stop) => {
                    tracing::info!("stop requested");
                    return None;
                }
                Some(AgentEvent::Shutdown) => *shutdown = true,
                Some(other) => tracing::warn!(?other, "control event ignored while running"),
                None => {
                    *shutdown = true;
                    open = false;
                }
            },
            out = &mut fut => return Some(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::broadcast;

    use crate::agent_engine::event_bus::EventBus;
    use crate::config::{LlmConfig, ProviderEntry, RoleEntry, RolesConfig};
    use crate::errors::{WebClawError, WebClawResult};
    use crate::llm::provider::LlmProvider;
    use crate::llm::types::{CallConfig, ChatMessage, LlmResponse};
    use crate::perception::traits::InputEvent;
    use crate::perception::types::{BoundingBox, PageEvent, RawAxNode};

    const CLICK_GO: &str =
        r#"{"thought":"press go","action":{"type":"click","nodeId":"2","description":"Click Go"}}"#;
    const CLICK_SEARCH: &str =
        r#"{"thought":"focus search","action":{"type":"click","nodeId":"1","description":"Click Search"}}"#;
    const DONE: &str = r#"{"thought":"results are shown","action":{"type":"done","reason":"all set"}}"#;

    // ── Scripted browser ─────────────────────────────────────────────────────

    struct Page {
        geometry: Option<BoundingBox>,
        captures: AtomicUsize,
        inputs: Mutex<Vec<InputEvent>>,
        /// Screenshots fail with `SessionLost`.
        lost: bool,
        /// The first settle after any input sends a stop and never finishes.
        stop_on_settle: Mutex<Option<mpsc::Sender<AgentEvent>>>,
    }

    impl Page {
        fn new() -> Arc<Self> {
            Self::build(Some(BoundingBox { x: 10.0, y: 20.0, width: 100.0, height: 40.0 }), false)
        }

        fn detached() -> Arc<Self> {
            Self::build(None, false)
        }

        fn closed() -> Arc<Self> {
            Self::build(None, true)
        }

        fn build(geometry: Option<BoundingBox>, lost: bool) -> Arc<Self> {
            Arc::new(Self {
                geometry,
                captures: AtomicUsize::new(0),
                inputs: Mutex::new(Vec::new()),
                lost,
                stop_on_settle: Mutex::new(None),
            })
        }

        fn stop_on_settle(&self, tx: mpsc::Sender<AgentEvent>) {
            *self.stop_on_settle.lock().unwrap() = Some(tx);
        }

        fn captures(&self) -> usize {
            self.captures.load(Ordering::SeqCst)
        }

        fn clicks(&self) -> usize {
            self.inputs
                .lock()
                .unwrap()
                .iter()
                .filter(|e| matches!(e, InputEvent::MouseDown { .. }))
                .count()
        }

        fn input_count(&self) -> usize {
            self.inputs.lock().unwrap().len()
        }
    }

    fn raw(id: &str, role: &str, name: &str, backend: i64) -> RawAxNode {
        RawAxNode {
            node_id: id.into(),
            role: Some(role.into()),
            name: Some(name.into()),
            backend_node_id: Some(backend),
            ..Default::default()
        }
    }

    #[async_trait]
    impl BrowserSession for Page {
        async fn accessibility_tree(&self) -> WebClawResult<Vec<RawAxNode>> {
            Ok(vec![raw("1", "searchbox", "Search", 11), raw("2", "button", "Go", 12)])
        }

        async fn screenshot(&self) -> WebClawResult<Vec<u8>> {
            if self.lost {
                return Err(WebClawError::SessionLost("target closed".into()));
            }
            self.captures.fetch_add(1, Ordering::SeqCst);
            Ok(vec![0xff, 0xd8, 0xff])
        }

        async fn drain_events(&self) -> WebClawResult<Vec<PageEvent>> {
            Ok(Vec::new())
        }

        async fn dispatch_input(&self, event: InputEvent) -> WebClawResult<()> {
            self.inputs.lock().unwrap().push(event);
            Ok(())
        }

        async fn node_geometry(&self, _backend_node_id: i64) -> WebClawResult<Option<BoundingBox>> {
            Ok(self.geometry)
        }

        async fn wait_for_quiescence(&self, _timeout: Duration) -> WebClawResult<bool> {
            let stop = if self.input_count() > 0 {
                self.stop_on_settle.lock().unwrap().take()
            } else {
                None
            };
            if let Some(tx) = stop {
                tx.send(AgentEvent::Stop).await.unwrap();
                return std::future::pending().await;
            }
            Ok(true)
        }

        async fn current_url(&self) -> WebClawResult<String> {
            Ok("https://shop.test/search".into())
        }

        async fn navigate(&self, _url: &str) -> WebClawResult<()> {
            Ok(())
        }

        async fn highlight(&self, _bbox: BoundingBox, _duration: Duration) -> WebClawResult<()> {
            Ok(())
        }
    }

    // ── Scripted backend ─────────────────────────────────────────────────────

    struct Backend {
        replies: Mutex<VecDeque<String>>,
        /// Returned once the queue is empty.
        repeat: Option<String>,
        seen: Mutex<Vec<(String, String)>>,
        /// On this 1-based call, send a stop and never answer.
        stop_on: Mutex<Option<(usize, mpsc::Sender<AgentEvent>)>>,
    }

    impl Backend {
        fn new(replies: &[&str]) -> Arc<Self> {
            Self::build(replies, None)
        }

        fn repeating(reply: &str) -> Arc<Self> {
            Self::build(&[], Some(reply))
        }

        fn build(replies: &[&str], repeat: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
                repeat: repeat.map(str::to_string),
                seen: Mutex::new(Vec::new()),
                stop_on: Mutex::new(None),
            })
        }

        fn stop_on_call(&self, call: usize, tx: mpsc::Sender<AgentEvent>) {
            *self.stop_on.lock().unwrap() = Some((call, tx));
        }

        fn models(&self) -> Vec<String> {
            self.seen.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
        }

        fn prompt(&self, call: usize) -> String {
            self.seen.lock().unwrap()[call].1.clone()
        }
    }

    #[async_trait]
    impl LlmProvider for Backend {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn chat(&self, messages: Vec<ChatMessage>, cfg: &CallConfig) -> WebClawResult<LlmResponse> {
            let call = {
                let mut seen = self.seen.lock().unwrap();
                seen.push((cfg.model.clone(), serde_json::to_string(&messages).unwrap()));
                seen.len()
            };
            let stop = self
                .stop_on
                .lock()
                .unwrap()
                .as_ref()
                .filter(|(n, _)| *n == call)
                .map(|(_, tx)| tx.clone());
            if let Some(tx) = stop {
                tx.send(AgentEvent::Stop).await.unwrap();
                return std::future::pending().await;
            }
            let next = self.replies.lock().unwrap().pop_front();
            match next.or_else(|| self.repeat.clone()) {
                Some(content) => Ok(LlmResponse { content, reasoning: String::new() }),
                None => Err(WebClawError::LlmProvider("script exhausted".into())),
            }
        }
    }

    // ── Harness ──────────────────────────────────────────────────────────────

    struct Harness {
        engine: AgentEngine,
        bus: EventBus,
        events: broadcast::Receiver<OutboundEvent>,
    }

    impl Harness {
        fn drain(&mut self) -> Vec<OutboundEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }
    }

    fn config(max_steps: u32) -> AppConfig {
        let mut providers = HashMap::new();
        providers.insert(
            "scripted".to_string(),
            ProviderEntry {
                display_name: "Scripted".into(),
                api_base: "http://localhost".into(),
                model: "default-model".into(),
                temperature: 0.1,
                api_key: None,
            },
        );
        let role = |model: &str| RoleEntry {
            provider: "scripted".into(),
            model: model.into(),
            stream: false,
            temperature: None,
        };

        let mut cfg = AppConfig::default();
        cfg.llm = LlmConfig {
            active_provider: "scripted".into(),
            providers,
            roles: RolesConfig {
                reasoning: Some(role("big-model")),
                fast: Some(role("small-model")),
            },
        };
        cfg.agent.max_steps = max_steps;
        cfg.perception.settle_timeout_ms = 0;
        cfg.executor.quiescence_timeout_ms = 0;
        cfg.executor.click_hold_ms = 0;
        cfg.executor.keystroke_delay_ms = 0;
        cfg.executor.highlight_ms = 0;
        cfg.executor.max_wait_ms = 0;
        cfg.report.enabled = false;
        cfg
    }

    fn harness(page: Arc<Page>, backend: Arc<Backend>, cfg: AppConfig) -> Harness {
        let mut registry = ProviderRegistry::with_config(cfg.llm.clone());
        registry.register(backend);
        let (bus, command_rx) = EventBus::new();
        let events = bus.subscribe();
        let engine = AgentEngine::new(page, Arc::new(registry), &cfg, command_rx, bus.emitter());
        Harness { engine, bus, events }
    }

    fn terminal(events: &[OutboundEvent]) -> Vec<&OutboundEvent> {
        events.iter().filter(|e| e.is_terminal()).collect()
    }

    fn goal() -> Goal {
        Goal::new("search for rust books", false)
    }

    // ── Tests ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn done_completes_without_another_capture() {
        let page = Page::new();
        let backend = Backend::new(&[CLICK_GO, CLICK_SEARCH, DONE]);
        let mut h = harness(page.clone(), backend.clone(), config(10));

        let summary = h.engine.run_goal(goal()).await;

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.cycles, 3);
        assert_eq!(summary.message, GOAL_ACHIEVED);
        assert_eq!(page.captures(), 3);
        assert_eq!(page.clicks(), 2);
        assert_eq!(h.engine.state(), RunState::Completed);

        let events = h.drain();
        let terminal = terminal(&events);
        assert_eq!(terminal.len(), 1);
        assert!(matches!(events.last(), Some(OutboundEvent::Success { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, OutboundEvent::Log { message } if message == "Summary: all set")));
    }

    #[tokio::test]
    async fn routes_reasoning_first_then_fast() {
        let page = Page::new();
        let backend = Backend::new(&[CLICK_GO, CLICK_SEARCH, DONE]);
        let mut h = harness(page, backend.clone(), config(10));

        h.engine.run_goal(goal()).await;

        assert_eq!(backend.models(), vec!["big-model", "small-model", "small-model"]);
        let thoughts: Vec<String> = h
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                OutboundEvent::Thought { model, .. } => Some(model),
                _ => None,
            })
            .collect();
        assert_eq!(thoughts[0], "reasoning (big-model)");
        assert_eq!(thoughts[1], "fast (small-model)");
    }

    #[tokio::test]
    async fn step_budget_allows_exactly_max_steps_cycles() {
        let page = Page::new();
        let backend = Backend::new(&[CLICK_GO, CLICK_SEARCH, CLICK_GO, CLICK_SEARCH, CLICK_GO, CLICK_SEARCH]);
        let mut h = harness(page.clone(), backend.clone(), config(4));

        let summary = h.engine.run_goal(goal()).await;

        assert_eq!(summary.state, RunState::Failed);
        assert_eq!(summary.cycles, 4);
        assert_eq!(summary.message, "Agent stopped: step budget exceeded");
        assert_eq!(page.captures(), 4);
        assert_eq!(page.clicks(), 4);
        assert_eq!(backend.models().len(), 4);
        assert_eq!(terminal(&h.drain()).len(), 1);
    }

    #[tokio::test]
    async fn repeated_action_gets_one_hint_then_loop_protection() {
        let page = Page::new();
        let backend = Backend::repeating(CLICK_GO);
        let mut h = harness(page.clone(), backend.clone(), config(10));

        let summary = h.engine.run_goal(goal()).await;

        assert_eq!(summary.state, RunState::Failed);
        assert_eq!(summary.message, "Agent stopped: loop protection");
        assert_eq!(summary.cycles, 4);
        // The fourth decision repeats the flagged one and is never dispatched.
        assert_eq!(page.clicks(), 3);
        assert_eq!(
            backend.models(),
            vec!["big-model", "small-model", "small-model", "big-model"]
        );
        assert!(!backend.prompt(2).contains("You are repeating yourself"));
        assert!(backend.prompt(3).contains("You are repeating yourself"));

        let events = h.drain();
        let hints = events
            .iter()
            .filter(|e| matches!(e, OutboundEvent::Log { message } if message.starts_with("Loop detected")))
            .count();
        assert_eq!(hints, 1);
        assert_eq!(terminal(&events).len(), 1);
    }

    #[tokio::test]
    async fn changing_approach_after_hint_keeps_running() {
        let page = Page::new();
        let backend = Backend::new(&[CLICK_GO, CLICK_GO, CLICK_GO, CLICK_SEARCH, DONE]);
        let mut h = harness(page.clone(), backend, config(10));

        let summary = h.engine.run_goal(goal()).await;

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(page.clicks(), 4);
    }

    #[tokio::test]
    async fn stop_during_decision_skips_dispatch() {
        let page = Page::new();
        let backend = Backend::repeating(CLICK_GO);
        let mut h = harness(page.clone(), backend.clone(), config(10));
        backend.stop_on_call(2, h.bus.command_sender());

        let summary = h.engine.run_goal(goal()).await;

        assert_eq!(summary.state, RunState::Failed);
        assert_eq!(summary.message, EXECUTION_INTERRUPTED);
        assert_eq!(summary.cycles, 2);
        assert_eq!(page.captures(), 2);
        assert_eq!(page.clicks(), 1);

        let events = h.drain();
        let terminal = terminal(&events);
        assert_eq!(terminal.len(), 1);
        assert_eq!(
            terminal[0],
            &OutboundEvent::Error { message: EXECUTION_INTERRUPTED.into() }
        );
    }

    #[tokio::test]
    async fn stop_during_settle_wins_over_the_step_budget() {
        let page = Page::new();
        let backend = Backend::new(&[CLICK_GO, DONE]);
        let mut h = harness(page.clone(), backend.clone(), config(1));
        page.stop_on_settle(h.bus.command_sender());

        let summary = h.engine.run_goal(goal()).await;

        assert_eq!(summary.state, RunState::Failed);
        assert_eq!(summary.message, EXECUTION_INTERRUPTED);
        assert_eq!(summary.cycles, 1);
        assert_eq!(page.clicks(), 1);
        assert_eq!(page.captures(), 1);
        assert_eq!(backend.models().len(), 1);

        let events = h.drain();
        let terminal = terminal(&events);
        assert_eq!(terminal.len(), 1);
        assert_eq!(
            terminal[0],
            &OutboundEvent::Error { message: EXECUTION_INTERRUPTED.into() }
        );
    }

    #[tokio::test]
    async fn stop_interrupts_a_long_wait() {
        let page = Page::new();
        let backend = Backend::new(&[r#"{"thought":"let it load","action":{"type":"wait","value":"60000"}}"#]);
        let mut cfg = config(10);
        cfg.executor.max_wait_ms = 60_000;
        let mut h = harness(page.clone(), backend, cfg);
        let stop = h.bus.command_sender();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.send(AgentEvent::Stop).await.unwrap();
        });

        let summary = tokio::time::timeout(Duration::from_secs(5), h.engine.run_goal(goal()))
            .await
            .expect("wait was not interrupted");

        assert_eq!(summary.message, EXECUTION_INTERRUPTED);
        assert_eq!(summary.cycles, 1);
        assert_eq!(terminal(&h.drain()).len(), 1);
    }

    #[tokio::test]
    async fn lost_session_fails_the_run() {
        let page = Page::closed();
        let backend = Backend::repeating(CLICK_GO);
        let mut h = harness(page.clone(), backend.clone(), config(10));

        let summary = h.engine.run_goal(goal()).await;

        assert_eq!(summary.state, RunState::Failed);
        assert!(summary.message.starts_with("Agent stopped: Browser session lost"));
        assert_eq!(summary.cycles, 1);
        assert!(backend.models().is_empty());
        assert_eq!(page.input_count(), 0);

        let events = h.drain();
        let terminal = terminal(&events);
        assert_eq!(terminal.len(), 1);
        assert!(matches!(terminal[0], OutboundEvent::Error { message } if message.contains("target closed")));
    }

    #[tokio::test]
    async fn missing_element_is_reported_and_rerouted() {
        let page = Page::detached();
        let backend = Backend::new(&[CLICK_GO, DONE]);
        let mut h = harness(page.clone(), backend.clone(), config(10));

        let summary = h.engine.run_goal(goal()).await;

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(page.input_count(), 0);
        // The failed outcome sends the next cycle back to the reasoning tier.
        assert_eq!(backend.models(), vec!["big-model", "big-model"]);
        assert!(backend.prompt(1).contains("element not found"));
        assert!(h.drain().iter().any(|e| matches!(
            e,
            OutboundEvent::Protocol { message } if message.starts_with("Action click failed: element not found")
        )));
    }

    #[tokio::test]
    async fn invalid_reply_is_corrected_once() {
        let page = Page::new();
        let backend = Backend::new(&["I think I should click Go", DONE]);
        let mut h = harness(page, backend.clone(), config(10));

        let summary = h.engine.run_goal(goal()).await;

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(backend.models().len(), 2);
    }

    #[tokio::test]
    async fn persistent_invalid_reply_fails_the_run() {
        let page = Page::new();
        let backend = Backend::new(&["no json here", r#"{"action":{"type":"click","nodeId":"99"}}"#]);
        let mut h = harness(page.clone(), backend, config(10));

        let summary = h.engine.run_goal(goal()).await;

        assert_eq!(summary.state, RunState::Failed);
        assert!(summary.message.starts_with("Agent stopped: Invalid decision"));
        assert_eq!(page.input_count(), 0);
        assert_eq!(terminal(&h.drain()).len(), 1);
    }

    #[tokio::test]
    async fn backend_errors_count_toward_the_failure_limit() {
        let page = Page::new();
        let backend = Backend::new(&[]);
        let mut cfg = config(10);
        cfg.agent.max_consecutive_failures = 2;
        let mut h = harness(page.clone(), backend.clone(), cfg);

        let summary = h.engine.run_goal(goal()).await;

        assert_eq!(summary.message, "Agent stopped: too many consecutive failures");
        assert_eq!(summary.cycles, 2);
        assert_eq!(backend.models(), vec!["big-model", "big-model"]);
    }

    #[tokio::test]
    async fn step_by_step_pauses_until_resumed() {
        let page = Page::new();
        let backend = Backend::new(&[CLICK_GO, DONE]);
        let mut h = harness(page.clone(), backend, config(10));

        let tx = h.bus.command_sender();
        let mut watcher = h.bus.subscribe();
        let approver = tokio::spawn(async move {
            let mut pauses = 0;
            while let Ok(event) = watcher.recv().await {
                match event {
                    OutboundEvent::Pause { rationale, .. } => {
                        assert_eq!(rationale, "press go");
                        pauses += 1;
                        tx.send(AgentEvent::Resume).await.unwrap();
                    }
                    e if e.is_terminal() => break,
                    _ => {}
                }
            }
            pauses
        });

        let summary = h
            .engine
            .run_goal(Goal::new("search for rust books", true))
            .await;

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(page.clicks(), 1);
        assert_eq!(approver.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stop_while_paused_interrupts() {
        let page = Page::new();
        let backend = Backend::new(&[CLICK_GO, DONE]);
        let mut h = harness(page.clone(), backend, config(10));

        let tx = h.bus.command_sender();
        let mut watcher = h.bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = watcher.recv().await {
                if matches!(event, OutboundEvent::Pause { .. }) {
                    tx.send(AgentEvent::Stop).await.unwrap();
                    break;
                }
            }
        });

        let summary = h
            .engine
            .run_goal(Goal::new("search for rust books", true))
            .await;

        assert_eq!(summary.message, EXECUTION_INTERRUPTED);
        assert_eq!(page.input_count(), 0);
        assert_eq!(terminal(&h.drain()).len(), 1);
    }

    #[tokio::test]
    async fn report_is_announced_before_the_terminal_event() {
        let dir = tempfile::tempdir().unwrap();
        let page = Page::new();
        let backend = Backend::new(&[CLICK_GO, DONE]);
        let h = harness(page, backend, config(10));
        let Harness { engine, bus, events } = h;
        let mut h = Harness {
            engine: engine.with_reports(ReportManager::new(dir.path())),
            bus,
            events,
        };

        h.engine.run_goal(goal()).await;

        let events = h.drain();
        let report_at = events
            .iter()
            .position(|e| matches!(e, OutboundEvent::Report { .. }))
            .unwrap();
        let terminal_at = events.iter().position(|e| e.is_terminal()).unwrap();
        assert!(report_at < terminal_at);
        assert_eq!(terminal_at, events.len() - 1);

        let OutboundEvent::Report { location } = &events[report_at] else {
            unreachable!()
        };
        let report: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(location).unwrap()).unwrap();
        assert_eq!(report["status"], "success");
        assert_eq!(report["steps"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn shutdown_lets_the_current_run_finish() {
        let page = Page::new();
        let backend = Backend::new(&[CLICK_GO, DONE]);
        let mut h = harness(page, backend, config(10));
        h.bus.command_sender().send(AgentEvent::Shutdown).await.unwrap();

        let summary = h.engine.run_goal(goal()).await;

        assert_eq!(summary.state, RunState::Completed);
        // The idle loop exits at once afterwards.
        h.engine.run_loop().await;
    }
}
