//! Simple example of running a circuit pool against a live tor bundle.

use std::time::Duration;
use tor_circuit_pool::{Outcome, PoolConfig, CircuitPool};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("Starting circuit pool...");

    let config = PoolConfig::builder()
        .target_size(3)
        .tor_binary("/usr/bin/tor")
        .data_dir("./tor-data-pool")
        // seed new instances from an already-bootstrapped main instance
        .reference_data_dir("./tor-data")
        .base_socks_port(9060)
        .base_control_port(9160)
        .cooldown_window(Duration::from_secs(300))
        .race_size(3)
        .probe_url("https://check.torproject.org/api/ip")
        .build();

    let pool = CircuitPool::start(config).await?;

    let ready = pool.wait_ready(Duration::from_secs(120)).await;
    println!("{ready} circuit(s) ready");

    let handle = pool.acquire(Some(Duration::from_secs(30))).await?;
    println!(
        "won the race: {} via {}",
        handle.instance_id,
        handle.proxy_endpoint.socks_url()
    );

    // ... fetch through handle.proxy_endpoint here ...
    pool.report_outcome(&handle, Outcome::Success);

    let stats = pool.stats();
    println!(
        "pool: {}/{} healthy, {} cooling, {} recent blocks",
        stats.healthy_count, stats.total, stats.cooldown_count, stats.recent_blocks
    );

    pool.shutdown().await;
    Ok(())
}
