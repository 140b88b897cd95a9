//! tiercache stress driver
//!
//! Runs a concurrent get/clear workload against an [`ObjectCache`] and
//! prints the resulting statistics as JSON.
//!
//! ```text
//! ┌──────────┐  ┌──────────┐       ┌──────────┐
//! │ worker 0 │  │ worker 1 │  ...  │ worker N │
//! └────┬─────┘  └────┬─────┘       └────┬─────┘
//!      └─────────────┴──────┬───────────┘
//!                           ▼
//!                     ObjectCache ──▶ stats JSON (stdout)
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::{CacheKey, CacheParams, Error, ObjectCache, Result, Tier};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tiercache - stress a typed build-once object cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Worker threads
    #[arg(long, env = "TIERCACHE_THREADS", default_value = "8")]
    threads: usize,

    /// Distinct keys in the workload
    #[arg(long, env = "TIERCACHE_KEYS", default_value = "64")]
    keys: usize,

    /// Requests per worker
    #[arg(long, env = "TIERCACHE_ITERATIONS", default_value = "10000")]
    iterations: usize,

    /// Storage tier (memory-only, memory-and-temp-dir, memory-and-persist, persist-only)
    #[arg(long, env = "TIERCACHE_TIER", default_value = "memory-only")]
    tier: String,

    /// Every Nth request clears its key instead (0 disables)
    #[arg(long, env = "TIERCACHE_CLEAR_EVERY", default_value = "0")]
    clear_every: usize,

    /// Simulated build time in milliseconds
    #[arg(long, env = "TIERCACHE_BUILD_MS", default_value = "1")]
    build_ms: u64,

    /// Lock wait timeout in milliseconds (0 waits forever)
    #[arg(long, env = "TIERCACHE_LOCK_TIMEOUT_MS", default_value = "0")]
    lock_timeout_ms: u64,

    /// YAML file with cache parameters
    #[arg(long, env = "TIERCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Root directory for temp and persist dirs (overrides the config)
    #[arg(long, env = "TIERCACHE_ROOT")]
    root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

/// Value built by the workload
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Payload {
    key: String,
    checksum: u64,
    data: Vec<u32>,
}

impl Payload {
    fn build(key: &CacheKey, build_time: Duration) -> Self {
        thread::sleep(build_time);
        let data: Vec<u32> = (0..256u32)
            .map(|i| i.wrapping_mul(key.combined_hash() as u32))
            .collect();
        Self {
            key: key.joined(),
            checksum: key.combined_hash(),
            data,
        }
    }
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let tier: Tier = args.tier.parse()?;
    let mut params = match &args.config {
        Some(path) => CacheParams::from_yaml_file(path)?,
        None => CacheParams::default(),
    };
    if let Some(root) = &args.root {
        params.temp_dir = root.join("temp");
        params.persist_dir = root.join("persist");
    }

    info!("Starting tiercache stress run");
    info!("  Threads: {}", args.threads);
    info!("  Keys: {}", args.keys);
    info!("  Iterations per thread: {}", args.iterations);
    info!("  Tier: {}", tier);
    info!("  Persist dir: {}", params.persist_dir.display());

    if args.keys == 0 {
        return Err(Error::Config("--keys must be positive".into()));
    }

    let cache = Arc::new(ObjectCache::new(params)?);
    let failures = Arc::new(AtomicU64::new(0));
    let start = Arc::new(Barrier::new(args.threads.max(1)));
    let build_time = Duration::from_millis(args.build_ms);
    let timeout = (args.lock_timeout_ms > 0).then(|| Duration::from_millis(args.lock_timeout_ms));

    let started = Instant::now();
    let workers = (0..args.threads.max(1))
        .map(|worker| {
            let cache = Arc::clone(&cache);
            let failures = Arc::clone(&failures);
            let start = Arc::clone(&start);
            let keys = args.keys;
            let iterations = args.iterations;
            let clear_every = args.clear_every;

            thread::Builder::new()
                .name(format!("tiercache-worker-{worker}"))
                .spawn(move || {
                    start.wait();
                    for i in 0..iterations {
                        let index = (i * 31 + worker * 7) % keys;
                        let name = format!("item-{index}");

                        if clear_every > 0 && (i + 1) % clear_every == 0 {
                            if let Err(e) = cache.clear_item::<Payload>(["stress", name.as_str()]) {
                                warn!(worker, error = %e, "Clear failed");
                                failures.fetch_add(1, Ordering::Relaxed);
                            }
                            continue;
                        }

                        let result = cache.get_item_with_timeout(
                            ["stress", name.as_str()],
                            tier,
                            |key: &CacheKey| anyhow::Ok(Payload::build(key, build_time)),
                            timeout,
                        );
                        if let Err(e) = result {
                            warn!(worker, error = %e, "Request failed");
                            failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
                .map_err(Error::Io)
        })
        .collect::<Result<Vec<_>>>()?;

    for worker in workers {
        if worker.join().is_err() {
            error!("Worker thread panicked");
            failures.fetch_add(1, Ordering::Relaxed);
        }
    }
    let elapsed = started.elapsed();

    let snapshot = cache.stat_snapshot();
    let report = serde_json::json!({
        "elapsed_ms": elapsed.as_millis() as u64,
        "requests_per_sec": requests_per_sec(&args, elapsed),
        "failures": failures.load(Ordering::Relaxed),
        "entries": cache.len(),
        "hit_ratio": snapshot.total.hit_ratio(),
        "memory": cache.memory_status(),
        "locks": cache.lock_counters(),
        "stats": snapshot,
    });

    println!("{}", serde_json::to_string_pretty(&report)?);

    cache.shutdown();
    info!("Stress run complete");
    Ok(())
}

fn requests_per_sec(args: &Args, elapsed: Duration) -> f64 {
    let total = (args.threads.max(1) * args.iterations) as f64;
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        total / secs
    } else {
        total
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so stdout stays valid JSON
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
