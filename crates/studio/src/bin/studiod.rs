//! Boots the orchestration core from the environment and relays its events
//! to stdout as server-sent-event frames until interrupted.

use mcp_studio::{Event, JsonFileStore, Studio, StudioConfig};
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mcp_studio=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = StudioConfig::from_env()?;
    let store = Arc::new(JsonFileStore::new(config.data_path.clone()));
    let studio = Arc::new(Studio::boot(config, store).await?);
    tracing::info!(
        flows = studio.flows().len(),
        boot = studio.boot_session().token(),
        "Studio ready"
    );

    let mut stdout = std::io::stdout();
    let emit = move |event: &Event| {
        stdout.write_all(event.to_sse_frame().as_bytes())?;
        stdout.flush()
    };
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for ctrl-c: {e}");
        }
    };
    relay(studio, emit, shutdown).await
}

/// Run auto-start in the background and hand every event to `emit` until
/// `shutdown` resolves, then shut the studio down
async fn relay<E, S>(studio: Arc<Studio>, mut emit: E, shutdown: S) -> anyhow::Result<()>
where
    E: FnMut(&Event) -> std::io::Result<()>,
    S: Future<Output = ()>,
{
    let mut events = studio.subscribe();
    // Subscribed first so the batch's own events are relayed while it runs
    let auto_start = tokio::spawn({
        let studio = studio.clone();
        async move {
            let report = studio.evaluate_auto_start(None).await;
            tracing::info!(
                started = report.started.len(),
                failed = report.failed.len(),
                inspector = report.inspector_started,
                "Auto-start evaluated"
            );
        }
    });

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.next() => match event {
                Some(event) => emit(&event)?,
                None => break,
            },
        }
    }

    studio.shutdown().await?;
    auto_start.abort();
    Ok(())
}
