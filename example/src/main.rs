use anyhow::{anyhow, Result};
use async_trait::async_trait;
use converge::{
    operation_fn, until_cancelled, BoxedOperation, CancellationSignal, Coordinator,
    CoordinatorConfig, FinalCallback, RunSnapshot,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
struct Probe {
    mirror: String,
    latency_ms: u64,
}

// Simulated health check against one mirror
fn probe(mirror: &str, latency_ms: u64, healthy: bool) -> BoxedOperation<Probe> {
    let mirror = mirror.to_string();
    operation_fn(move |cancel: CancellationSignal| {
        until_cancelled(cancel, async move {
            tokio::time::sleep(Duration::from_millis(latency_ms)).await;
            if !healthy {
                return Err(anyhow!("{} returned 503", mirror));
            }
            Ok(Probe { mirror, latency_ms })
        })
    })
}

struct Report;

#[async_trait]
impl FinalCallback<Probe> for Report {
    async fn on_complete(
        &self,
        snapshot: RunSnapshot<Probe>,
        _cancel: CancellationSignal,
    ) -> Result<()> {
        let fastest = snapshot.results.iter().min_by_key(|p| p.latency_ms);
        match fastest {
            Some(probe) => println!("fastest mirror: {} ({} ms)", probe.mirror, probe.latency_ms),
            None => println!("no healthy mirror"),
        }
        for failure in snapshot.failures.iter().flat_map(|f| f.iter()) {
            println!("unhealthy: {}", failure);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = CoordinatorConfig::load("coordinator.yaml")?;

    let coordinator = Coordinator::builder()
        .name("mirror-probe")
        .operation(probe("eu-1", 120, true))
        .operation(probe("eu-2", 40, true))
        .operation(probe("us-1", 80, false))
        .operation(probe("ap-1", 200, true))
        .transform(|probe: Probe| Ok((probe.latency_ms < 150).then_some(probe)))
        .final_callback(Arc::new(Report))
        .config(config)
        .build()?;

    let outcome = coordinator.run_blocking().await?;
    info!(
        run_id = %outcome.run_id,
        healthy = outcome.results.len(),
        failures = outcome.failure_count(),
        "Probe finished"
    );
    println!("{}", serde_json::to_string_pretty(&outcome.metrics)?);

    Ok(())
}
