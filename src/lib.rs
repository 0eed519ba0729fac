pub mod agent_engine;
pub mod browser;
pub mod commands;
pub mod config;
pub mod errors;
pub mod executor;
pub mod llm;
pub mod perception;
pub mod report;

use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::agent_engine::engine::AgentEngine;
use crate::agent_engine::event_bus::{EventBus, OutboundEvent};
use crate::browser::cdp::CdpSession;
use crate::config::AppConfig;
use crate::errors::WebClawResult;
use crate::llm::registry::ProviderRegistry;
use crate::report::ReportManager;

/// Entry point of the `webclaw` binary: control messages in on stdin,
/// outbound events out on stdout, logs on stderr.
pub async fn run() -> WebClawResult<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load .env file if present (ignore error if not found)
    let _ = dotenvy::dotenv();

    let app_config = match config::load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config; using defaults");
            AppConfig::default()
        }
    };

    let registry = Arc::new(ProviderRegistry::from_config(&app_config));
    tracing::info!(
        active = %app_config.llm.active_provider,
        providers = ?registry.list_names(),
        "LLM registry ready"
    );

    let session = Arc::new(CdpSession::launch(&app_config.browser).await?);

    let (bus, command_rx) = EventBus::new();
    let outbound = bus.subscribe();

    let mut engine = AgentEngine::new(
        session.clone(),
        registry,
        &app_config,
        command_rx,
        bus.emitter(),
    );
    if app_config.report.enabled {
        engine = engine.with_reports(ReportManager::new(app_config.report.resolved_dir()));
    }

    let writer = tokio::spawn(write_events(outbound, tokio::io::stdout()));
    tokio::spawn(commands::pump_stdin(bus.command_sender()));

    engine.run_loop().await;

    session.close().await;
    drop(engine);
    drop(bus);
    if let Err(e) = writer.await {
        tracing::warn!(error = %e, "event writer task failed");
    }
    Ok(())
}

/// Serialises outbound events as JSON lines until the bus closes or the
/// writer fails. Returns the writer.
async fn write_events<W>(mut rx: tokio::sync::broadcast::Receiver<OutboundEvent>, mut out: W) -> W
where
    W: AsyncWrite + Unpin,
{
    use tokio::sync::broadcast::error::RecvError;

    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event writer lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let mut line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialise outbound event");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = out.write_all(line.as_bytes()).await {
            tracing::error!(error = %e, "event stream closed");
            break;
        }
        if let Err(e) = out.flush().await {
            tracing::error!(error = %e, "event stream flush failed");
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    /// Accepts writes, refuses to flush.
    struct Unflushable(Vec<u8>);

    impl AsyncWrite for Unflushable {
        fn poll_write(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            self.0.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "reader went away")))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn writes_one_json_line_per_event() {
        let (bus, _commands) = EventBus::new();
        let rx = bus.subscribe();
        let emitter = bus.emitter();
        emitter.log("Thinking...");
        emitter.emit(OutboundEvent::Success { message: "done".into() });
        drop(emitter);
        drop(bus);

        let out = write_events(rx, Vec::new()).await;
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let last: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(last["message"], "done");
    }

    #[tokio::test]
    async fn flush_failure_stops_the_writer() {
        let (bus, _commands) = EventBus::new();
        let rx = bus.subscribe();
        bus.emitter().log("first");

        // The bus stays open, so only the flush error can end the writer.
        let out = tokio::time::timeout(Duration::from_secs(5), write_events(rx, Unflushable(Vec::new())))
            .await
            .expect("writer kept running after a failed flush");
        assert!(!out.0.is_empty());
        drop(bus);
    }
}
