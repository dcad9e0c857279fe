//! CLI commands for the node
//!
//! Implements all command handlers for the CLI interface.

use crate::core::{
    unix_time, Behavior, BitmessageAddress, NetworkAddress, ObjectMessage, ObjectType, HOUR,
    NETWORK_EXTRA_BYTES, NETWORK_NONCE_TRIALS_PER_BYTE,
};
use crate::network::{ConnectionPool, MessageListener, NetworkConfig, NetworkStatus};
use crate::pow::{nonce, MultiThreadedPowEngine, PowQueue, ProofOfWorkEngine, SimplePowEngine};
use crate::storage::{Inventory, MemoryInventory, MemoryNodeRegistry, NodeRegistry};
use rand::RngCore;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// How often a running node prints its status
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Read a JSON network configuration, or the defaults without a file
pub fn load_config(path: Option<&Path>) -> CliResult<NetworkConfig> {
    match path {
        Some(path) => {
            let data = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&data)?)
        }
        None => Ok(NetworkConfig::default()),
    }
}

/// Resolve `host:port` strings, skipping those that do not resolve
async fn resolve_peers(peers: &[String]) -> Vec<SocketAddr> {
    let mut resolved = Vec::new();
    for peer in peers {
        match tokio::net::lookup_host(peer.as_str()).await {
            Ok(addresses) => resolved.extend(addresses),
            Err(e) => log::warn!("Cannot resolve {}: {}", peer, e),
        }
    }
    resolved
}

fn print_status(status: &NetworkStatus) {
    println!("ℹ️  Network status:");
    println!("   ├─ Running: {}", status.running);
    for (stream, counts) in &status.streams {
        println!(
            "   ├─ Stream {}: {} incoming, {} outgoing",
            stream, counts.incoming, counts.outgoing
        );
    }
    println!("   └─ Total connections: {}", status.total());
}

/// Run a node until Ctrl+C
pub async fn cmd_node_start(
    config: NetworkConfig,
    peers: &[String],
    bootstrap: Option<&Path>,
) -> CliResult<()> {
    let registry = match bootstrap {
        Some(path) => MemoryNodeRegistry::from_file(path)?,
        None => MemoryNodeRegistry::with_default_bootstrap(),
    };
    let stream = config.streams.first().copied().unwrap_or(1);
    let now = unix_time();
    let known: Vec<NetworkAddress> = resolve_peers(peers)
        .await
        .into_iter()
        .map(|addr| NetworkAddress::from_socket_addr(addr, stream, now))
        .collect();
    if !known.is_empty() {
        println!("📇 {} peer address(es) added", known.len());
        registry.offer_addresses(known);
    }

    let inventory = Arc::new(MemoryInventory::new());
    let pool = Arc::new(ConnectionPool::new(
        config.clone(),
        inventory.clone(),
        Arc::new(registry),
    ));
    let queue = Arc::new(PowQueue::start(
        Arc::new(MultiThreadedPowEngine::new()),
        inventory.clone(),
        pool.gossip_sender(),
        config.nonce_trials_per_byte,
        config.extra_bytes,
    ));

    let listener_queue = Arc::clone(&queue);
    let listener: Arc<dyn MessageListener> = Arc::new(move |object: &ObjectMessage| {
        log::debug!(
            "New object {} ({:?}) in stream {}",
            object.inventory_vector(),
            object.kind(),
            object.stream
        );
        if object.kind() == Some(ObjectType::Pubkey) {
            let released = listener_queue.pubkey_discovered(object);
            if released > 0 {
                log::info!("Released {} job(s) waiting for a public key", released);
            }
        }
    });

    let address = pool.start(listener).await?;
    println!("🌐 Node listening on {}", address);
    println!("   Streams: {:?}", config.streams);
    println!("   Target connections: {}", config.connection_limit);

    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                print_status(&pool.network_status().await);
                println!("   📦 Objects in inventory: {}", inventory.len());
            }
        }
    }

    println!("\n📴 Shutting down node...");
    pool.stop().await;
    Ok(())
}

/// Fetch all objects of a trusted node, then exit
pub async fn cmd_node_sync(config: NetworkConfig, peer: &str, timeout: Duration) -> CliResult<()> {
    let remote = resolve_peers(&[peer.to_string()])
        .await
        .into_iter()
        .next()
        .ok_or_else(|| format!("cannot resolve {}", peer))?;

    let streams = config.streams.clone();
    let inventory = Arc::new(MemoryInventory::new());
    let pool = ConnectionPool::new(
        config,
        inventory.clone(),
        Arc::new(MemoryNodeRegistry::new()),
    );

    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    let listener: Arc<dyn MessageListener> = Arc::new(move |_: &ObjectMessage| {
        counter.fetch_add(1, Ordering::Relaxed);
    });

    println!("🔄 Synchronizing with {} (timeout {:?})...", remote, timeout);
    let started = Instant::now();
    pool.synchronize(remote, timeout, listener).await??;

    println!("✅ Synchronization finished in {:.1}s", started.elapsed().as_secs_f64());
    println!("   📦 Objects received: {}", received.load(Ordering::Relaxed));
    for stream in streams {
        let counts: Vec<String> = [
            ObjectType::GetPubkey,
            ObjectType::Pubkey,
            ObjectType::Msg,
            ObjectType::Broadcast,
        ]
        .iter()
        .map(|kind| {
            let count = inventory.query(stream, None, Some(kind.number())).len();
            format!("{:?}: {}", kind, count)
        })
        .collect();
        println!("   └─ Stream {}: {}", stream, counts.join(", "));
    }
    Ok(())
}

/// Create a new identity and print its address and keys
pub fn cmd_identity_new(stream: u64, shorter: bool) -> CliResult<()> {
    println!("🔑 Generating identity{}...", if shorter { " (shorter)" } else { "" });
    let identity = BitmessageAddress::new_identity(
        stream,
        Behavior::DOES_ACK,
        shorter,
        NETWORK_NONCE_TRIALS_PER_BYTE,
        NETWORK_EXTRA_BYTES,
    );

    println!("🔐 New identity created!");
    println!("   📍 Address: {}", identity);
    println!("   ├─ Version: {}", identity.version());
    println!("   ├─ Stream: {}", identity.stream());
    if let Some((signing, encryption)) = identity.export_private_key() {
        println!("   ├─ Signing key: {}", signing);
        println!("   └─ Encryption key: {}", encryption);
    }
    Ok(())
}

/// Time both proof-of-work engines on a random object of `bytes` bytes
pub async fn cmd_pow(bytes: usize, workers: Option<usize>, trials: u64) -> CliResult<()> {
    let mut body = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut body);
    let now = unix_time();
    let object = ObjectMessage::new(now + HOUR, 2, 1, 1, body);
    let target = object.target(trials, NETWORK_EXTRA_BYTES, now);
    let initial_hash = object.initial_hash();

    println!("⛏️  Proof of work for {} bytes", bytes);
    println!("   ├─ Nonce trials per byte: {}", trials);
    println!("   └─ Target: {}", hex::encode(target));

    let multi = match workers {
        Some(workers) => MultiThreadedPowEngine::with_workers(workers),
        None => MultiThreadedPowEngine::new(),
    };
    let engines: Vec<(String, Box<dyn ProofOfWorkEngine>)> = vec![
        ("simple".to_string(), Box::new(SimplePowEngine::new())),
        (format!("{} workers", multi.workers()), Box::new(multi)),
    ];

    for (name, engine) in engines {
        let started = Instant::now();
        let found = nonce(engine.as_ref(), initial_hash, target).await?;
        println!("\n   Engine: {}", name);
        println!("   ├─ Nonce: {}", u64::from_be_bytes(found));
        println!("   └─ Time: {}ms", started.elapsed().as_millis());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_partial_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "port": 9000, "streams": [1, 2], "fanout": 3 }}"#).unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.streams, vec![1, 2]);
        assert_eq!(config.fanout, 3);
        assert_eq!(config.connection_limit, NetworkConfig::default().connection_limit);
        assert_eq!(config.nonce_trials_per_byte, NETWORK_NONCE_TRIALS_PER_BYTE);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("missing.json"))).is_err());
        assert_eq!(load_config(None).unwrap().port, NetworkConfig::default().port);
    }

    #[test]
    fn test_identity_new() {
        assert!(cmd_identity_new(1, false).is_ok());
    }

    #[tokio::test]
    async fn test_pow_benchmark_runs() {
        assert!(cmd_pow(64, Some(2), 1).await.is_ok());
    }
}
