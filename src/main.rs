use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use hostwatch::config::WatchConfig;
use hostwatch::model::{CompletionStatus, WorkItem};
use hostwatch::node::{ClusterNode, RunningNode};
use hostwatch::registry::{ExecutionGuard, ExecutionRegistry};
use hostwatch::shutdown::install_shutdown_handler;
use hostwatch::store::{MemoryStore, Store};

#[derive(Parser, Debug)]
#[command(name = "hostwatch")]
#[command(version)]
#[command(about = "Heartbeat crash detection and work reclamation over a shared store")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run several nodes in-process on one shared store, kill one and watch
    /// its work get reclaimed
    Simulate(SimulateArgs),

    /// Print the staleness thresholds implied by a heartbeat configuration
    Threshold {
        /// Heartbeat interval in milliseconds
        #[arg(long, default_value = "10000")]
        interval_ms: u64,

        /// Heartbeat intervals of silence tolerated before a node is dead
        #[arg(long, default_value = "12")]
        cycles: u32,

        /// Extra patience in milliseconds
        #[arg(long, default_value = "5000")]
        padding_ms: u64,
    },
}

#[derive(Parser, Debug)]
struct SimulateArgs {
    /// Number of nodes to start
    #[arg(long, default_value = "3")]
    nodes: usize,

    /// Resumable requests each node claims and executes
    #[arg(long, default_value = "3")]
    work_per_node: usize,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value = "200")]
    interval_ms: u64,

    /// Heartbeat intervals of silence tolerated before a node is dead
    #[arg(long, default_value = "3")]
    cycles: u32,

    /// Extra patience in milliseconds
    #[arg(long, default_value = "100")]
    padding_ms: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct NodeStatusOutput {
    host: String,
    inactive: bool,
    last_heartbeat_ms: Option<i64>,
}

#[derive(Serialize)]
struct SimulationOutput {
    crashed_host: String,
    threshold_ms: u64,
    detected_after_ms: Option<u64>,
    released_requests: usize,
    zombie_work_id: Option<String>,
    zombie_terminated: bool,
    nodes: Vec<NodeStatusOutput>,
}

#[derive(Serialize)]
struct ThresholdOutput {
    staleness_threshold_ms: u64,
    missed_heartbeat_threshold_ms: u64,
}

// =============================================================================
// Simulation
// =============================================================================

struct SimNode {
    running: RunningNode,
    // Held for as long as the simulated executor is "running" the work.
    guards: Vec<ExecutionGuard>,
}

async fn start_sim_node(
    args: &SimulateArgs,
    index: usize,
    store: &Arc<MemoryStore>,
) -> Result<SimNode, Box<dyn std::error::Error>> {
    let host = format!("node-{}", index);
    let config = WatchConfig::new(host.clone())
        .with_heartbeat_interval_ms(args.interval_ms)
        .with_crash_detection_cycles(args.cycles)
        .with_padding_ms(args.padding_ms)
        .with_zombie_check_interval_ms(args.interval_ms * 2)
        .with_zombie_sample_gap_ms((args.interval_ms / 4).max(1))
        .with_lock_timeout_ms(args.interval_ms);

    let registry = ExecutionRegistry::new();
    let shared: Arc<dyn Store> = store.clone();
    let node = ClusterNode::new(config, shared, registry.clone())?;
    let running = node.start().await?;

    let now = store.now().await?;
    let mut guards = Vec::new();
    for j in 0..args.work_per_node {
        let mut item = WorkItem::request(format!("{}-request-{}", host, j));
        item.claim(&host, now);
        store.save_work(&item).await?;
        guards.push(registry.register(item.id));
    }

    Ok(SimNode { running, guards })
}

async fn run_simulation(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.nodes < 2 {
        return Err("simulation needs at least two nodes".into());
    }

    let store = Arc::new(MemoryStore::new());
    let interval = Duration::from_millis(args.interval_ms);
    let threshold = WatchConfig::default()
        .with_heartbeat_interval_ms(args.interval_ms)
        .with_crash_detection_cycles(args.cycles)
        .with_padding_ms(args.padding_ms)
        .staleness_threshold();

    let mut nodes = Vec::with_capacity(args.nodes);
    for i in 1..=args.nodes {
        nodes.push(start_sim_node(&args, i, &store).await?);
    }

    // A task run the last node claims but whose executor never registered it.
    let zombie_host = nodes
        .last()
        .map(|n| n.running.host().to_string())
        .unwrap_or_default();
    let mut zombie = WorkItem::task_run(format!("{}-orphaned-run", zombie_host));
    zombie.claim(&zombie_host, store.now().await?);
    store.save_work(&zombie).await?;

    tokio::time::sleep(interval * 2).await;

    let victim = nodes.remove(0);
    let crashed_host = victim.running.host().to_string();
    let victim_work: Vec<Uuid> = victim.guards.iter().map(|g| g.id()).collect();
    tracing::info!(host = %crashed_host, "Killing node");
    let killed_at = Instant::now();
    victim.running.halt().await;
    drop(victim.guards);

    let deadline = threshold + interval * 6;
    let mut detected_after = None;
    while killed_at.elapsed() < deadline {
        if node_released(&store, &crashed_host, &victim_work).await? {
            detected_after = Some(killed_at.elapsed());
            break;
        }
        tokio::time::sleep(interval / 4).await;
    }

    let released_requests = store
        .all_work()
        .await
        .iter()
        .filter(|w| victim_work.contains(&w.id) && w.owner_host.is_none())
        .count();
    let zombie_terminated = store
        .get_work(zombie.id)
        .await?
        .map(|w| w.completion == Some(CompletionStatus::Terminated))
        .unwrap_or(false);

    for node in nodes {
        node.running.shutdown().await?;
    }

    let output = SimulationOutput {
        crashed_host,
        threshold_ms: threshold.as_millis() as u64,
        detected_after_ms: detected_after.map(|d| d.as_millis() as u64),
        released_requests,
        zombie_work_id: Some(zombie.id.to_string()),
        zombie_terminated,
        nodes: store
            .all_nodes()
            .await
            .into_iter()
            .map(|n| NodeStatusOutput {
                host: n.host_id,
                inactive: n.inactive,
                last_heartbeat_ms: n.last_heartbeat.map(|t| t.timestamp_millis()),
            })
            .collect(),
    };

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Table => print_simulation(&output),
    }
    Ok(())
}

async fn node_released(
    store: &MemoryStore,
    host: &str,
    work: &[Uuid],
) -> Result<bool, Box<dyn std::error::Error>> {
    let inactive = store
        .get_node(host)
        .await?
        .map(|n| n.inactive)
        .unwrap_or(false);
    if !inactive {
        return Ok(false);
    }
    for id in work {
        if let Some(item) = store.get_work(*id).await? {
            if item.owner_host.is_some() {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

fn print_simulation(output: &SimulationOutput) {
    println!("Crashed node:      {}", output.crashed_host);
    println!("Threshold:         {} ms", output.threshold_ms);
    match output.detected_after_ms {
        Some(ms) => println!("Reclaimed after:   {} ms", ms),
        None => println!("Reclaimed after:   NOT DETECTED"),
    }
    println!("Released requests: {}", output.released_requests);
    println!(
        "Zombie task run:   {}",
        if output.zombie_terminated {
            "terminated"
        } else {
            "still claimed"
        }
    );
    println!();
    println!("{:<12} {:<10} LAST HEARTBEAT (ms)", "HOST", "STATE");
    println!("{}", "-".repeat(44));
    for node in &output.nodes {
        println!(
            "{:<12} {:<10} {}",
            node.host,
            if node.inactive { "INACTIVE" } else { "ACTIVE" },
            node.last_heartbeat_ms
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Simulate(sim_args) => {
            let shutdown = install_shutdown_handler();
            tokio::select! {
                result = run_simulation(sim_args) => result?,
                _ = shutdown.cancelled() => {
                    eprintln!("Simulation interrupted");
                }
            }
        }
        Commands::Threshold {
            interval_ms,
            cycles,
            padding_ms,
        } => {
            let config = WatchConfig::default()
                .with_heartbeat_interval_ms(interval_ms)
                .with_crash_detection_cycles(cycles)
                .with_padding_ms(padding_ms);
            config.validate()?;
            let output = ThresholdOutput {
                staleness_threshold_ms: config.staleness_threshold().as_millis() as u64,
                missed_heartbeat_threshold_ms: config.missed_heartbeat_threshold().as_millis()
                    as u64,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
