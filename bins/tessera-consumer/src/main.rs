use anyhow::{Context, Result};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tessera_bus::ConsumerBus;
use tessera_config::TesseraConfig;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ATTACH_TIMEOUT: Duration = Duration::from_secs(10);

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn load_config() -> Result<TesseraConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            TesseraConfig::load(path.as_str()).with_context(|| format!("loading config from {path}"))
        }
        None => Ok(TesseraConfig::default()),
    }
}

fn main() -> Result<()> {
    let cfg = load_config()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level)),
        )
        .init();

    let mut bus = ConsumerBus::attach_with_retry(&cfg, ATTACH_TIMEOUT)
        .with_context(|| format!("attaching to record bus at {}", cfg.shm_url))?;
    info!(url = %cfg.shm_url, depth = bus.queue().depth(), "attached");

    let start = Instant::now();
    let mut last = Instant::now();
    let mut received = 0u64;
    let mut since_last = 0u64;
    let mut next_seq = 0u64;
    let mut gaps = 0u64;
    let mut latency_sum_ns = 0u128;

    loop {
        match bus.try_recv() {
            Some(record) => {
                if record.seq != next_seq {
                    gaps += 1;
                }
                next_seq = record.seq + 1;
                latency_sum_ns += now_ns().saturating_sub(record.ts_ns) as u128;
                received += 1;
                since_last += 1;
            }
            None if bus.root().is_producer_done() && bus.queue().is_empty() => break,
            None => std::hint::spin_loop(),
        }

        if last.elapsed() >= Duration::from_secs(1) {
            info!(rate = since_last, received, "records/s");
            since_last = 0;
            last = Instant::now();
        }
    }
    bus.root().mark_drained();

    let elapsed = start.elapsed();
    let mean_latency_ns = latency_sum_ns.checked_div(received as u128).unwrap_or(0) as u64;
    info!(
        received,
        ?elapsed,
        per_sec = (received as f64 / elapsed.as_secs_f64()) as u64,
        mean_latency_ns,
        "drained"
    );
    if gaps > 0 {
        warn!(gaps, "sequence gaps observed");
    }
    Ok(())
}
