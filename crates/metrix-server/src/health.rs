use metrix_storage::{Collector, Context};
use std::sync::Arc;
use tokio::time::{interval, Duration};

/// Probes the collector every `every` until `ctx` is cancelled, logging
/// state changes.
pub async fn run_health_checks(ctx: Context, collector: Arc<dyn Collector>, every: Duration) {
    let mut tick = interval(every);
    let mut healthy = true;
    loop {
        tokio::select! {
            _ = ctx.token().cancelled() => break,
            _ = tick.tick() => {
                match collector.ping(&ctx).await {
                    Ok(()) if !healthy => {
                        tracing::info!("Metric storage is reachable again");
                        healthy = true;
                    }
                    Ok(()) => {}
                    Err(e) => {
                        if healthy {
                            tracing::error!(error = %e, "Metric storage health check failed");
                        } else {
                            tracing::debug!(error = %e, "Metric storage still unhealthy");
                        }
                        healthy = false;
                    }
                }
            }
        }
    }
}
