//! Election demonstration
//!
//! Starts three engines on loopback, waits for them to agree on a leader,
//! stops the leader and watches the survivors elect the next one.

use bully_cluster::{ElectionConfig, ElectionEngine, IdentityStrategy, LoggingObserver, NodeId};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("🚀 Starting Bully Election Demo");

    let mut engines: Vec<ElectionEngine> = Vec::new();
    for id in [10u128, 20, 30] {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let peers = engines.iter().map(|e| e.my_addr().to_string()).collect();
        let engine =
            ElectionEngine::new(listener, peers, Arc::new(LoggingObserver), demo_config(id)).await?;
        println!("   Node {} listening on {}", engine.my_id(), engine.my_addr());
        engines.push(engine);
    }

    sleep(Duration::from_secs(3)).await;
    println!("\n📊 Leaders after startup:");
    report(&engines).await;

    if let Some(leader) = engines.pop() {
        println!("\n🛑 Stopping node {}", leader.my_id());
        leader.finalize().await;
    }

    sleep(Duration::from_secs(5)).await;
    println!("\n📊 Leaders after failover:");
    report(&engines).await;

    for engine in &engines {
        engine.finalize().await;
    }

    println!("\n🏁 Demo completed");
    Ok(())
}

fn demo_config(id: u128) -> ElectionConfig {
    ElectionConfig {
        identity: IdentityStrategy::Fixed {
            id: NodeId::from(id),
        },
        answer_timeout: Duration::from_millis(500),
        coordinator_timeout: Duration::from_secs(1),
        probe_interval: Duration::from_millis(250),
        probe_timeout: Duration::from_millis(250),
        ..Default::default()
    }
}

async fn report(engines: &[ElectionEngine]) {
    for engine in engines {
        match engine.leader().await {
            Ok(record) => println!(
                "   Node {} ({}): leader {} since {}",
                engine.my_id(),
                engine.phase(),
                record.leader,
                record.elected_at
            ),
            Err(e) => println!("❌ Node {}: {}", engine.my_id(), e),
        }
    }
}
