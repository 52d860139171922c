use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bitcoin::hashes::Hash;
use bitcoin::{Address, Network, PubkeyHash};
use clap::Parser;

use cfilter_chain_client::{
    ChainClient, ClientConfig, ClientError, MockChainService, MockRescanFactory, Notification,
    RescanFactory,
};

type DemoClient = ChainClient<MockChainService>;

#[derive(Parser)]
#[command(author, version, about = "Drives the chain client against in-memory backends")]
struct Args {
    /// Length of the in-memory chain.
    #[arg(long, default_value_t = 100)]
    blocks: u32,

    /// Error every rescan worker reports once started. Repeatable.
    #[arg(long)]
    worker_errors: Vec<String>,

    /// Number of start/stop cycles.
    #[arg(long, default_value_t = 3)]
    cycles: u32,

    /// Concurrent requests per cycle. Every third one also rescans from genesis.
    #[arg(long, default_value_t = 100)]
    requests: u32,

    /// JSON file with client timeouts.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug)]
struct CycleResult {
    cycle: u32,
    requests: u32,
    failed: u32,
    updates: usize,
    workers: usize,
    notifications: usize,
    rescan_errors: usize,
    scanning: bool,
    elapsed: Duration,
}

#[derive(Debug, Default)]
struct Drained {
    total: usize,
    rescan_errors: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ClientConfig::from_json_file(path)?,
        None => ClientConfig::default(),
    };
    let chain = Arc::new(MockChainService::new(args.blocks));
    let factory = Arc::new(MockRescanFactory::new().with_errors(args.worker_errors.clone()));
    let client = Arc::new(ChainClient::new(
        chain.clone(),
        factory.clone() as Arc<dyn RescanFactory>,
        config,
    ));
    println!("[MAIN] Config: {:?}", client.config());
    println!(
        "[MAIN] Backend: {}, tip {}",
        client.backend(),
        client.block_stamp().await?
    );

    let mut results = Vec::new();
    for cycle in 1..=args.cycles {
        println!("[MAIN] Running cycle {}/{}...", cycle, args.cycles);
        let result = run_cycle(cycle, &client, &factory, args.requests).await?;
        print_cycle(&result);
        results.push(result);
    }

    print_summary(&results);

    if factory.live_count() != 0 {
        anyhow::bail!("{} rescan workers still alive after shutdown", factory.live_count());
    }
    Ok(())
}

async fn run_cycle(
    cycle: u32,
    client: &Arc<DemoClient>,
    factory: &MockRescanFactory,
    requests: u32,
) -> Result<CycleResult> {
    let t0 = Instant::now();
    let updates_before = factory.total_updates();
    let workers_before = factory.spawned_count();

    client.start().await?;
    let mut notifications = client
        .take_notifications()
        .context("notification stream already taken")?;

    let drain = tokio::spawn(async move {
        let mut drained = Drained::default();
        while let Some(notification) = notifications.recv().await {
            if let Notification::RescanError(err) = &notification {
                log::debug!("[MAIN] worker reported: {}", err);
                drained.rescan_errors += 1;
            }
            drained.total += 1;
        }
        drained
    });

    let tasks: Vec<_> = (0..requests)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                let addr = demo_address(cycle, i);
                client.notify_received(&[addr.clone()]).await?;
                if i % 3 == 0 {
                    client.rescan(None, &[addr], &HashMap::new()).await?;
                }
                Ok::<_, ClientError>(())
            })
        })
        .collect();

    let mut failed = 0;
    for task in tasks {
        if let Err(err) = task.await? {
            log::warn!("[MAIN] request failed: {}", err);
            failed += 1;
        }
    }

    let scanning = client.is_scanning();
    client.stop();
    client
        .wait_for_shutdown_timeout(Duration::from_secs(10))
        .await?;
    let drained = drain.await?;

    Ok(CycleResult {
        cycle,
        requests,
        failed,
        updates: factory.total_updates() - updates_before,
        workers: factory.spawned_count() - workers_before,
        notifications: drained.total,
        rescan_errors: drained.rescan_errors,
        scanning,
        elapsed: t0.elapsed(),
    })
}

fn demo_address(cycle: u32, i: u32) -> Address {
    let mut seed = cycle.to_le_bytes().to_vec();
    seed.extend_from_slice(&i.to_le_bytes());
    Address::p2pkh(PubkeyHash::hash(&seed), Network::Regtest)
}

fn print_cycle(r: &CycleResult) {
    println!("-----------------------------------");
    println!("Cycle:            {}", r.cycle);
    println!("Requests:         {} ({} failed)", r.requests, r.failed);
    println!("Workers spawned:  {}", r.workers);
    println!("Updates applied:  {}", r.updates);
    println!("Notifications:    {}", r.notifications);
    println!("Scanning at stop: {}", r.scanning);
    println!("Total Time:       {:?}", r.elapsed);
    println!("-----------------------------------");
}

fn print_summary(results: &[CycleResult]) {
    println!();
    println!("==========================================================================");
    println!("                              CYCLE SUMMARY                               ");
    println!("==========================================================================");
    println!(
        "{:<6} | {:<9} | {:<7} | {:<8} | {:<8} | {:<7} | {:<12}",
        "Cycle", "Requests", "Failed", "Workers", "Updates", "Errors", "Time"
    );
    println!("--------------------------------------------------------------------------");

    for r in results {
        println!(
            "{:<6} | {:<9} | {:<7} | {:<8} | {:<8} | {:<7} | {:<12?}",
            r.cycle, r.requests, r.failed, r.workers, r.updates, r.rescan_errors, r.elapsed
        );
    }

    let total: Duration = results.iter().map(|r| r.elapsed).sum();
    let requests: u32 = results.iter().map(|r| r.requests).sum();

    println!("--------------------------------------------------------------------------");
    if !total.is_zero() {
        println!(
            "Throughput: {:.0} requests/s",
            requests as f64 / total.as_secs_f64()
        );
    }
    println!("==========================================================================");
}
