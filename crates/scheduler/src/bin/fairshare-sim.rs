//! fairshare-sim: exercise the scheduler with synthetic load.
//!
//! Several owners push tasks through the keyed intake while a number of
//! pull-style producers attach to the same dispatcher. When everything has
//! drained, per-owner completion order and dispatcher stats are printed as
//! JSON.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{info, warn};

use fairshare_core::config::load_dotenv;
use fairshare_scheduler::{
    Dispatcher, KeyedIntake, Producer, ProducerConfig, SchedulerConfig, Task,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Drive the fair scheduler with synthetic owners and producers.
#[derive(Parser, Debug)]
#[command(name = "fairshare-sim", version, about)]
struct Cli {
    /// Path to a scheduler TOML config. Falls back to the environment.
    #[arg(long, env = "FAIRSHARE_CONFIG")]
    config: Option<String>,

    /// Number of owners pushing tasks through the keyed intake.
    #[arg(long, default_value_t = 4)]
    owners: usize,

    /// Tasks each owner submits.
    #[arg(long, default_value_t = 25)]
    tasks_per_owner: usize,

    /// Number of pull-style producers attached directly.
    #[arg(long, default_value_t = 2)]
    producers: usize,

    /// Tasks each producer issues.
    #[arg(long, default_value_t = 25)]
    tasks_per_producer: usize,

    /// Simulated work per task in milliseconds.
    #[arg(long, default_value_t = 10)]
    task_millis: u64,

    /// Give up waiting for completion after this many seconds.
    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,
}

fn load_config(cli: &Cli) -> anyhow::Result<SchedulerConfig> {
    let config = match &cli.config {
        Some(path) => match SchedulerConfig::from_file(path) {
            Ok(cfg) => {
                info!(path = %path, "loaded scheduler config");
                cfg
            }
            Err(e) => {
                warn!(error = %e, path = %path, "failed to load config, using environment");
                SchedulerConfig::from_env()?
            }
        },
        None => SchedulerConfig::from_env()?,
    };
    Ok(config)
}

fn sleeper(owner: String, millis: u64, done: Arc<Mutex<Vec<String>>>) -> Task {
    let key = owner.clone();
    Task::new(owner, move || {
        std::thread::sleep(Duration::from_millis(millis));
        if let Ok(mut done) = done.lock() {
            done.push(key);
        }
        Ok(())
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    config.log_summary();

    let dispatcher = Dispatcher::from_config(&config)?;
    let intake = Arc::new(KeyedIntake::from_config(&dispatcher, &config));
    let done = Arc::new(Mutex::new(Vec::new()));
    let started = Instant::now();

    // Pull-style producers.
    let producers: Vec<Arc<Producer>> = (0..cli.producers)
        .map(|i| {
            let name = format!("producer-{i}");
            let left = AtomicUsize::new(cli.tasks_per_producer);
            let done = Arc::clone(&done);
            let owner = name.clone();
            let millis = cli.task_millis;
            Producer::new(
                &dispatcher,
                ProducerConfig::from_scheduler_config(name, &config),
                move || {
                    left.fetch_update(Ordering::AcqRel, Ordering::Acquire, |l| l.checked_sub(1))
                        .ok()
                        .map(|_| sleeper(owner.clone(), millis, Arc::clone(&done)))
                },
            )
        })
        .collect();
    dispatcher.run_loop();

    // Push-style owners, one thread each.
    let submitters: Vec<_> = (0..cli.owners)
        .map(|i| {
            let intake = Arc::clone(&intake);
            let done = Arc::clone(&done);
            let owner = format!("owner-{i}");
            let (count, millis) = (cli.tasks_per_owner, cli.task_millis);
            std::thread::spawn(move || {
                let mut rejected = 0usize;
                for _ in 0..count {
                    if let Err(e) = intake.submit(sleeper(owner.clone(), millis, Arc::clone(&done))) {
                        warn!(owner = %owner, error = %e, "submission rejected");
                        rejected += 1;
                    }
                }
                rejected
            })
        })
        .collect();

    let mut rejected = 0;
    for handle in submitters {
        rejected += handle
            .join()
            .map_err(|_| anyhow::anyhow!("submitter thread panicked"))?;
    }
    intake.close();

    let timeout = Duration::from_secs(cli.timeout_secs);
    let mut drained = intake.await_completion(timeout);
    for producer in &producers {
        drained &= producer.await_completion(timeout);
    }
    if !drained {
        warn!("timed out waiting for tasks to finish");
    }

    let order = done.lock().map(|d| d.clone()).unwrap_or_default();
    let mut per_owner: HashMap<String, usize> = HashMap::new();
    for owner in &order {
        *per_owner.entry(owner.clone()).or_default() += 1;
    }

    let report = serde_json::json!({
        "elapsed_ms": started.elapsed().as_millis() as u64,
        "rejected": rejected,
        "completed_per_owner": per_owner,
        "first_completions": order.iter().take(20).collect::<Vec<_>>(),
        "dispatcher": dispatcher.stats(),
        "producers": producers.iter().map(|p| p.stats()).collect::<Vec<_>>(),
        "intake": intake.producer().stats(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
