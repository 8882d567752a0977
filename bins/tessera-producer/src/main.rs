use anyhow::{Context, Result};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tessera_bus::{ProducerBus, Record};
use tessera_config::TesseraConfig;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

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

    let bus = ProducerBus::create(&cfg)
        .with_context(|| format!("creating record bus at {}", cfg.shm_url))?;
    info!(records = cfg.records, "publishing");

    let start = Instant::now();
    let mut last = Instant::now();
    let mut since_last = 0u64;
    for seq in 0..cfg.records {
        bus.publish(Record::new(seq, now_ns(), seq as i64));
        since_last += 1;

        if last.elapsed() >= Duration::from_secs(1) {
            info!(rate = since_last, backlog = bus.queue().size(), "records/s");
            since_last = 0;
            last = Instant::now();
        }
    }
    bus.root().mark_producer_done();
    let elapsed = start.elapsed();
    info!(
        records = cfg.records,
        ?elapsed,
        per_sec = (cfg.records as f64 / elapsed.as_secs_f64()) as u64,
        "publishing finished"
    );

    if bus.wait_drained(DRAIN_TIMEOUT) {
        info!("consumer drained the bus");
    } else {
        warn!(timeout = ?DRAIN_TIMEOUT, remaining = bus.queue().size(), "consumer did not drain the bus");
    }
    Ok(())
}
