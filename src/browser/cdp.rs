//! Chrome DevTools Protocol implementation of [`BrowserSession`] on top of
//! `chromiumoxide`: one launched Chrome, one page.
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromeConfig};
use chromiumoxide::cdp::browser_protocol::accessibility::{
    AxNode, AxPropertyName, AxValue, EnableParams as AxEnableParams, GetFullAxTreeParams,
};
use chromiumoxide::cdp::browser_protocol::dom::{
    BackendNodeId, GetBoxModelParams, ScrollIntoViewIfNeededParams,
};
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams,
    DispatchMouseEventType, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::log as cdp_log;
use chromiumoxide::cdp::browser_protocol::network::{
    self as cdp_network, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
    EventResponseReceived, ResourceType,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::js_protocol::runtime as cdp_runtime;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures_util::StreamExt;
use tokio::task::JoinHandle;

use crate::config::BrowserConfig;
use crate::errors::{WebClawError, WebClawResult};
use crate::perception::traits::{BrowserSession, InputEvent};
use crate::perception::types::{BoundingBox, PageEvent, PageEventKind, RawAxNode};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_BUFFERED_EVENTS: usize = 500;
const SCREENSHOT_QUALITY: i64 = 50;

#[derive(Default)]
struct NetworkState {
    /// request id -> url
    in_flight: HashMap<String, String>,
    last_activity: Option<Instant>,
}

impl NetworkState {
    fn touch(&mut self) {
        self.last_activity = Some(Instant::now());
    }

    fn quiet_for(&self, window: Duration) -> bool {
        self.in_flight.is_empty()
            && self
                .last_activity
                .map(|t| t.elapsed() >= window)
                .unwrap_or(true)
    }
}

/// Event buffer shared with the listener tasks.
#[derive(Clone, Default)]
struct EventBuffer(Arc<Mutex<VecDeque<PageEvent>>>);

impl EventBuffer {
    /// Oldest events are dropped once the buffer is full.
    fn push(&self, event: PageEvent) {
        if let Ok(mut buf) = self.0.lock() {
            if buf.len() >= MAX_BUFFERED_EVENTS {
                buf.pop_front();
            }
            buf.push_back(event);
        }
    }

    fn drain(&self) -> Vec<PageEvent> {
        self.0
            .lock()
            .map(|mut buf| buf.drain(..).collect())
            .unwrap_or_default()
    }
}

/// Spawns a task that feeds every `$event` from `$page` into `$body`.
macro_rules! spawn_listener {
    ($page:expr, $event:ty, |$evt:ident| $body:block) => {{
        let mut stream = $page
            .event_listener::<$event>()
            .await
            .map_err(|e| WebClawError::Browser(format!("event subscription failed: {e}")))?;
        tokio::spawn(async move {
            while let Some($evt) = stream.next().await $body
        })
    }};
}

pub struct CdpSession {
    browser: tokio::sync::Mutex<Browser>,
    page: Page,
    alive: Arc<AtomicBool>,
    events: EventBuffer,
    network: Arc<Mutex<NetworkState>>,
    quiet_window: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl CdpSession {
    pub async fn launch(config: &BrowserConfig) -> WebClawResult<Self> {
        let mut builder = ChromeConfig::builder().window_size(config.window_width, config.window_height);
        if !config.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &config.executable {
            builder = builder.chrome_executable(path);
        }
        let chrome_config = builder
            .build()
            .map_err(|e| WebClawError::Browser(format!("invalid browser config: {e}")))?;

        tracing::info!(headless = config.headless, "launching Chrome");
        let (browser, mut handler) = Browser::launch(chrome_config)
            .await
            .map_err(|e| WebClawError::Browser(format!("failed to launch Chrome: {e}")))?;

        let alive = Arc::new(AtomicBool::new(true));
        let handler_alive = alive.clone();
        let mut tasks = vec![tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::debug!(error = %e, "CDP handler error");
                }
            }
            handler_alive.store(false, Ordering::SeqCst);
            tracing::warn!("CDP connection closed");
        })];

        let page = browser
            .new_page(config.start_url.as_str())
            .await
            .map_err(|e| WebClawError::Browser(format!("failed to open page: {e}")))?;

        page.execute(cdp_network::EnableParams::default())
            .await
            .map_err(|e| WebClawError::Browser(format!("Network.enable failed: {e}")))?;
        page.execute(cdp_runtime::EnableParams::default())
            .await
            .map_err(|e| WebClawError::Browser(format!("Runtime.enable failed: {e}")))?;
        page.execute(cdp_log::EnableParams::default())
            .await
            .map_err(|e| WebClawError::Browser(format!("Log.enable failed: {e}")))?;
        page.execute(AxEnableParams::default())
            .await
            .map_err(|e| WebClawError::Browser(format!("Accessibility.enable failed: {e}")))?;

        let events = EventBuffer::default();
        let network = Arc::new(Mutex::new(NetworkState::default()));
        tasks.extend(Self::spawn_listeners(&page, &events, &network).await?);

        tracing::info!(url = %config.start_url, "browser session ready");
        Ok(Self {
            browser: tokio::sync::Mutex::new(browser),
            page,
            alive,
            events,
            network,
            quiet_window: Duration::from_millis(config.quiet_window_ms),
            tasks,
        })
    }

    async fn spawn_listeners(
        page: &Page,
        events: &EventBuffer,
        network: &Arc<Mutex<NetworkState>>,
    ) -> WebClawResult<Vec<JoinHandle<()>>> {
        let mut tasks = Vec::new();

        let buf = events.clone();
        tasks.push(spawn_listener!(page, cdp_runtime::EventConsoleApiCalled, |evt| {
            let text = evt
                .args
                .iter()
                .map(remote_object_text)
                .collect::<Vec<_>>()
                .join(" ");
            let level = format!("{:?}", evt.r#type).to_lowercase();
            buf.push(PageEvent::new(PageEventKind::Console, format!("[{level}] {text}")));
        }));

        let buf = events.clone();
        tasks.push(spawn_listener!(page, cdp_runtime::EventExceptionThrown, |evt| {
            let details = &evt.exception_details;
            let text = details
                .exception
                .as_ref()
                .and_then(|e| e.description.clone())
                .unwrap_or_else(|| details.text.clone());
            buf.push(PageEvent::new(PageEventKind::PageError, text));
        }));

        let buf = events.clone();
        tasks.push(spawn_listener!(page, cdp_log::EventEntryAdded, |evt| {
            if matches!(evt.entry.level, cdp_log::LogEntryLevel::Error) {
                buf.push(PageEvent::new(
                    PageEventKind::Console,
                    format!("[log] {}", evt.entry.text),
                ));
            }
        }));

        let net = network.clone();
        tasks.push(spawn_listener!(page, EventRequestWillBeSent, |evt| {
            // Long-lived connections would keep the page busy forever.
            if matches!(evt.r#type, Some(ResourceType::WebSocket) | Some(ResourceType::EventSource)) {
                continue;
            }
            if let Ok(mut state) = net.lock() {
                state
                    .in_flight
                    .insert(evt.request_id.inner().clone(), evt.request.url.clone());
                state.touch();
            }
        }));

        let net = network.clone();
        tasks.push(spawn_listener!(page, EventLoadingFinished, |evt| {
            if let Ok(mut state) = net.lock() {
                state.in_flight.remove(evt.request_id.inner());
                state.touch();
            }
        }));

        let net = network.clone();
        let buf = events.clone();
        tasks.push(spawn_listener!(page, EventLoadingFailed, |evt| {
            let url = net.lock().ok().and_then(|mut state| {
                state.touch();
                state.in_flight.remove(evt.request_id.inner())
            });
            if evt.canceled != Some(true) {
                buf.push(PageEvent::new(
                    PageEventKind::RequestFailed,
                    format!("{} ({})", url.unwrap_or_default(), evt.error_text),
                ));
            }
        }));

        let buf = events.clone();
        tasks.push(spawn_listener!(page, EventResponseReceived, |evt| {
            let status = evt.response.status;
            if status >= 400 {
                buf.push(PageEvent::new(
                    PageEventKind::HttpError,
                    format!("{status} {} {}", evt.response.status_text, evt.response.url),
                ));
            }
        }));

        Ok(tasks)
    }

    pub async fn close(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            tracing::warn!(error = %e, "browser close failed");
        }
    }

    fn ensure_alive(&self) -> WebClawResult<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(WebClawError::SessionLost("CDP connection closed".into()))
        }
    }

    fn cdp_failure(&self, context: &str, e: CdpError) -> WebClawError {
        if !self.alive.load(Ordering::SeqCst) || matches!(e, CdpError::ChannelSendError(_)) {
            return WebClawError::SessionLost(format!("{context}: {e}"));
        }
        WebClawError::Browser(format!("{context}: {e}"))
    }

    async fn document_ready(&self) -> WebClawResult<bool> {
        match self.page.evaluate("document.readyState").await {
            Ok(result) => Ok(result.into_value::<String>().map(|s| s == "complete").unwrap_or(false)),
            // Execution context torn down mid-navigation; just not ready yet.
            Err(e) => {
                self.ensure_alive()?;
                tracing::trace!(error = %e, "readyState probe failed");
                Ok(false)
            }
        }
    }

    async fn mouse(
        &self,
        kind: DispatchMouseEventType,
        x: f64,
        y: f64,
        delta_y: Option<f64>,
    ) -> WebClawResult<()> {
        let mut builder = DispatchMouseEventParams::builder().r#type(kind.clone()).x(x).y(y);
        builder = match kind {
            DispatchMouseEventType::MousePressed | DispatchMouseEventType::MouseReleased => {
                builder.button(MouseButton::Left).click_count(1)
            }
            _ => builder,
        };
        if let Some(delta_y) = delta_y {
            builder = builder.delta_x(0.0).delta_y(delta_y);
        }
        let params = builder
            .build()
            .map_err(|e| WebClawError::Executor(format!("mouse event: {e}")))?;
        self.page
            .execute(params)
            .await
            .map_err(|e| self.cdp_failure("Input.dispatchMouseEvent", e))?;
        Ok(())
    }

    async fn key(&self, params: DispatchKeyEventParams) -> WebClawResult<()> {
        self.page
            .execute(params)
            .await
            .map_err(|e| self.cdp_failure("Input.dispatchKeyEvent", e))?;
        Ok(())
    }
}

impl Drop for CdpSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl BrowserSession for CdpSession {
    async fn accessibility_tree(&self) -> WebClawResult<Vec<RawAxNode>> {
        self.ensure_alive()?;
        let tree = self
            .page
            .execute(GetFullAxTreeParams::default())
            .await
            .map_err(|e| self.cdp_failure("Accessibility.getFullAXTree", e))?;
        Ok(tree.result.nodes.iter().map(raw_node).collect())
    }

    async fn screenshot(&self) -> WebClawResult<Vec<u8>> {
        self.ensure_alive()?;
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Jpeg)
            .quality(SCREENSHOT_QUALITY)
            .build();
        self.page
            .screenshot(params)
            .await
            .map_err(|e| self.cdp_failure("Page.captureScreenshot", e))
    }

    async fn drain_events(&self) -> WebClawResult<Vec<PageEvent>> {
        Ok(self.events.drain())
    }

    async fn dispatch_input(&self, event: InputEvent) -> WebClawResult<()> {
        self.ensure_alive()?;
        match event {
            InputEvent::MouseMove { x, y } => {
                self.mouse(DispatchMouseEventType::MouseMoved, x, y, None).await
            }
            InputEvent::MouseDown { x, y } => {
                self.mouse(DispatchMouseEventType::MousePressed, x, y, None).await
            }
            InputEvent::MouseUp { x, y } => {
                self.mouse(DispatchMouseEventType::MouseReleased, x, y, None).await
            }
            InputEvent::Wheel { x, y, delta_y } => {
                self.mouse(DispatchMouseEventType::MouseWheel, x, y, Some(delta_y)).await
            }
            InputEvent::Char(ch) => {
                let params = DispatchKeyEventParams::builder()
                    .r#type(DispatchKeyEventType::Char)
                    .text(ch.to_string())
                    .build()
                    .map_err(|e| WebClawError::Executor(format!("key event: {e}")))?;
                self.key(params).await
            }
            InputEvent::Key(name) => {
                let (code, vk, text) = key_definition(&name);
                let mut down = DispatchKeyEventParams::builder()
                    .r#type(DispatchKeyEventType::KeyDown)
                    .key(name.clone())
                    .code(code.clone())
                    .windows_virtual_key_code(vk);
                if let Some(text) = text {
                    down = down.text(text);
                }
                let down = down
                    .build()
                    .map_err(|e| WebClawError::Executor(format!("key event: {e}")))?;
                self.key(down).await?;

                let up = DispatchKeyEventParams::builder()
                    .r#type(DispatchKeyEventType::KeyUp)
                    .key(name)
                    .code(code)
                    .windows_virtual_key_code(vk)
                    .build()
                    .map_err(|e| WebClawError::Executor(format!("key event: {e}")))?;
                self.key(up).await
            }
        }
    }

    async fn node_geometry(&self, backend_node_id: i64) -> WebClawResult<Option<BoundingBox>> {
        self.ensure_alive()?;
        let scroll = ScrollIntoViewIfNeededParams {
            node_id: None,
            backend_node_id: Some(BackendNodeId::new(backend_node_id)),
            object_id: None,
            rect: None,
        };
        if let Err(e) = self.page.execute(scroll).await {
            tracing::debug!(error = %e, backend_node_id, "scrollIntoViewIfNeeded failed");
        }

        let params = GetBoxModelParams {
            node_id: None,
            backend_node_id: Some(BackendNodeId::new(backend_node_id)),
            object_id: None,
        };
        match self.page.execute(params).await {
            Ok(resp) => Ok(BoundingBox::from_quad(resp.result.model.border.inner())),
            Err(e) => {
                self.ensure_alive()?;
                // "Could not compute box model": detached or display:none.
                tracing::debug!(error = %e, backend_node_id, "no box model");
                Ok(None)
            }
        }
    }

    async fn wait_for_quiescence(&self, timeout: Duration) -> WebClawResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            self.ensure_alive()?;
            let network_quiet = self
                .network
                .lock()
                .map(|state| state.quiet_for(self.quiet_window))
                .unwrap_or(true);
            if network_quiet && self.document_ready().await? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                let pending = self.network.lock().map(|s| s.in_flight.len()).unwrap_or(0);
                tracing::debug!(pending, "quiescence timeout");
                return Ok(false);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn current_url(&self) -> WebClawResult<String> {
        self.ensure_alive()?;
        let url = self
            .page
            .url()
            .await
            .map_err(|e| self.cdp_failure("Target.getTargetInfo", e))?;
        Ok(url.unwrap_or_else(|| "about:blank".into()))
    }

    async fn navigate(&self, url: &str) -> WebClawResult<()> {
        self.ensure_alive()?;
        self.page
            .goto(url)
            .await
            .map_err(|e| self.cdp_failure("Page.navigate", e))?;
        Ok(())
    }

    async fn highlight(&self, bbox: BoundingBox, duration: Duration) -> WebClawResult<()> {
        self.ensure_alive()?;
        let script = format!(
            "(() => {{\
               const d = document.createElement('div');\
               d.style.cssText = 'position:fixed;left:{x}px;top:{y}px;width:{w}px;height:{h}px;\
                 border:3px solid #ff3b30;border-radius:4px;background:rgba(255,59,48,0.15);\
                 z-index:2147483647;pointer-events:none;';\
               document.documentElement.appendChild(d);\
               setTimeout(() => d.remove(), {ms});\
             }})()",
            x = bbox.x,
            y = bbox.y,
            w = bbox.width,
            h = bbox.height,
            ms = duration.as_millis(),
        );
        self.page
            .evaluate(script)
            .await
            .map_err(|e| self.cdp_failure("highlight", e))?;
        Ok(())
    }
}

fn raw_node(node: &AxNode) -> RawAxNode {
    RawAxNode {
        node_id: node.node_id.inner().clone(),
        role: ax_string(&node.role),
        name: ax_string(&node.name),
        ignored: node.ignored,
        disabled: ax_flag(node, |name| matches!(name, AxPropertyName::Disabled)),
        hidden: ax_flag(node, |name| matches!(name, AxPropertyName::Hidden)),
        backend_node_id: node.backend_dom_node_id.as_ref().map(|id| *id.inner()),
    }
}

fn ax_string(value: &Option<AxValue>) -> Option<String> {
    value
        .as_ref()?
        .value
        .as_ref()
        .and_then(|v| v.as_str().map(str::to_string))
}

fn ax_flag(node: &AxNode, is_property: impl Fn(&AxPropertyName) -> bool) -> bool {
    node.properties
        .iter()
        .flatten()
        .filter(|p| is_property(&p.name))
        .any(|p| p.value.value.as_ref().and_then(|v| v.as_bool()).unwrap_or(false))
}

fn remote_object_text(obj: &cdp_runtime::RemoteObject) -> String {
    match &obj.value {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => obj.description.clone().unwrap_or_default(),
    }
}

/// DOM `code`, Windows virtual key code and produced text for a named key.
fn key_definition(name: &str) -> (String, i64, Option<String>) {
    match name {
        "Enter" => ("Enter".into(), 13, Some("\r".into())),
        "Tab" => ("Tab".into(), 9, None),
        "Escape" => ("Escape".into(), 27, None),
        "Backspace" => ("Backspace".into(), 8, None),
        "Delete" => ("Delete".into(), 46, None),
        " " | "Space" => ("Space".into(), 32, Some(" ".into())),
        "ArrowUp" => ("ArrowUp".into(), 38, None),
        "ArrowDown" => ("ArrowDown".into(), 40, None),
        "ArrowLeft" => ("ArrowLeft".into(), 37, None),
        "ArrowRight" => ("ArrowRight".into(), 39, None),
        "PageUp" => ("PageUp".into(), 33, None),
        "PageDown" => ("PageDown".into(), 34, None),
        "Home" => ("Home".into(), 36, None),
        "End" => ("End".into(), 35, None),
        other => (other.to_string(), 0, None),
    }
}
