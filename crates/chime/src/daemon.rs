//! Daemon wiring: store, scheduler lifecycle, completion logging.

use std::sync::Arc;

use miette::{IntoDiagnostic, Result};
use tokio::sync::broadcast;
use tracing::{info, warn};

use chime_scheduler::{Scheduler, SqliteStore, Timer, TimerStore};

/// Run the daemon until ctrl-c.
pub async fn run(db: &str) -> Result<()> {
    info!(db, "starting chime daemon");

    let store = SqliteStore::open(db).await.into_diagnostic()?;
    let scheduler = Arc::new(Scheduler::new(Arc::new(store) as Arc<dyn TimerStore>));

    // Completion consumer: logs every firing. Real feature consumers
    // subscribe the same way and match on the completion event name.
    let mut completions = scheduler.subscribe();
    let consumer = tokio::spawn(async move {
        loop {
            match completions.recv().await {
                Ok(timer) => log_completion(&timer),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "completion consumer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    scheduler.start().await;

    tokio::signal::ctrl_c().await.into_diagnostic()?;
    info!("received shutdown signal");

    scheduler.stop().await;
    consumer.abort();

    info!("daemon shut down gracefully");
    Ok(())
}

fn log_completion(timer: &Timer) {
    info!(
        event = %timer.completion_event(),
        id = ?timer.id,
        expiry = %timer.expiry,
        payload = %serde_json::Value::Object(timer.payload.clone()),
        "timer fired"
    );
}
