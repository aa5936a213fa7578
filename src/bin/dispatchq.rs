//! dispatchq CLI: drive the balancer with simulated producers.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dispatchq::config::Config;
use dispatchq::model::PoolSnapshot;
use dispatchq::telemetry::init_telemetry;
use dispatchq::{Dispatcher, DispatcherHandle};
use rand::Rng;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "dispatchq", about = "Least-loaded request dispatcher")]
struct Cli {
    /// TOML config file; environment variables are used when absent
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run producers against a worker pool, then drain and report loads
    Simulate {
        /// Worker count (overrides config)
        #[arg(long)]
        workers: Option<usize>,
        /// Number of concurrent producers
        #[arg(long, default_value_t = 15)]
        producers: usize,
        /// Requests each producer submits before stopping
        #[arg(long, default_value_t = 10)]
        requests: usize,
        /// Upper bound for both producer think time and operation run time
        #[arg(long, default_value_t = 50)]
        max_delay_ms: u64,
        /// Fraction of operations that return an error, in [0, 1]
        #[arg(long, default_value_t = 0.0, value_parser = parse_fail_rate)]
        fail_rate: f64,
        /// Print the final snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    match cli.command {
        Command::Simulate {
            workers,
            producers,
            requests,
            max_delay_ms,
            fail_rate,
            json,
        } => {
            let mut config = config;
            if let Some(workers) = workers {
                config.workers = workers;
            }
            config.max_producers = config.max_producers.max(producers);
            config.validate()?;
            let settings = Simulation {
                producers,
                requests,
                max_delay: Duration::from_millis(max_delay_ms.max(1)),
                fail_rate,
            };
            cmd_simulate(config, settings, json).await
        }
        Command::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn parse_fail_rate(s: &str) -> Result<f64, String> {
    let rate: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if !(0.0..=1.0).contains(&rate) {
        return Err(format!("{s} is not a probability between 0 and 1"));
    }
    Ok(rate)
}

struct Simulation {
    producers: usize,
    requests: usize,
    max_delay: Duration,
    fail_rate: f64,
}

async fn cmd_simulate(config: Config, sim: Simulation, json: bool) -> anyhow::Result<()> {
    let _guard = init_telemetry(config.telemetry("dispatchq"))?;

    let handle: DispatcherHandle<u64> = Dispatcher::spawn(&config.dispatch())?;
    info!(
        workers = config.workers,
        producers = sim.producers,
        requests = sim.requests,
        "simulation started"
    );

    let ctrl = handle.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        warn!("interrupted, draining");
        let _ = ctrl.shutdown().await;
    });

    let mut producers = JoinSet::new();
    for p in 1..=sim.producers {
        let handle = handle.clone();
        let (requests, max_delay, fail_rate) = (sim.requests, sim.max_delay, sim.fail_rate);
        producers.spawn(produce(handle, p, requests, max_delay, fail_rate));
    }

    let mut failures = 0usize;
    while let Some(joined) = producers.join_next().await {
        failures += joined?;
    }

    let snapshot = handle.shutdown().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_snapshot(&snapshot, failures);
    }
    Ok(())
}

/// One producer: think, submit, wait for the result, repeat.
async fn produce(
    handle: DispatcherHandle<u64>,
    producer: usize,
    requests: usize,
    max_delay: Duration,
    fail_rate: f64,
) -> usize {
    let mut failures = 0;
    for _ in 0..requests {
        let think = random_delay(max_delay);
        tokio::time::sleep(think).await;

        let work = random_delay(max_delay);
        let fail = rand::thread_rng().gen_bool(fail_rate);
        let result = handle
            .submit(move || async move {
                tokio::time::sleep(work).await;
                if fail {
                    anyhow::bail!("simulated failure after {}ms", work.as_millis());
                }
                Ok(work.as_millis() as u64)
            })
            .await;

        match result {
            Ok(value) => println!("request {producer} result {value}"),
            Err(dispatchq::Error::Closed) => break,
            Err(e) if e.is_operation_failure() => {
                failures += 1;
                println!("request {producer} error {e}");
            }
            Err(e) => {
                failures += 1;
                warn!(producer, error = %e, "request rejected");
            }
        }
    }
    failures
}

fn random_delay(max: Duration) -> Duration {
    let ms = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
    Duration::from_millis(ms)
}

fn print_snapshot(snapshot: &PoolSnapshot, failures: usize) {
    println!();
    println!(
        "{:<8}  {:<8}  {:<10}  POSITION",
        "WORKER", "PENDING", "DISPATCHED"
    );
    println!("{}", "-".repeat(42));
    for load in &snapshot.workers {
        let position = load
            .position
            .map(|p| p.to_string())
            .unwrap_or("-".to_string());
        println!(
            "{:<8}  {:<8}  {:<10}  {}",
            load.worker, load.pending, load.dispatched, position
        );
    }
    println!(
        "\ndispatched {}, completed {}, failed {}, heap ordered: {}",
        snapshot.dispatched, snapshot.completed, failures, snapshot.heap_ordered
    );
}
