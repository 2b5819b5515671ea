//! Talk to a running server example.
//!
//! Usage: `cargo run --example client -- [server_addr]`

use silo::{BulkAccess, Client, ClientConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("silo=debug,info")
        .init();

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7400".to_string());

    let client = Client::new(ClientConfig::default()).await?;
    let endpoint = client.lookup(&address).await?;
    let handle = client.provider_handle(endpoint, 1);

    let targets = handle.probe(None).await?;
    println!("Targets on {}: {:?}", endpoint, targets);
    let Some(&target) = targets.first() else {
        println!("No targets attached, nothing to do.");
        return Ok(());
    };

    // Small payload: sent inline.
    let region = handle.create(target, 32).await?;
    handle.write(target, &region, 0, &[b'A'; 16]).await?;
    handle.write(target, &region, 16, &[b'B'; 16]).await?;
    handle.persist(target, &region, 0, 32).await?;
    let data = handle.read(target, &region, 8, 16).await?;
    println!("Region {} bytes 8..24: {}", region, String::from_utf8_lossy(&data));

    // Large payload: crosses the eager limit and goes through a bulk buffer.
    let big = vec![0xabu8; 256 * 1024];
    let big_region = handle.create_write_persist(target, big.len() as u64, &big).await?;
    println!(
        "Region {} persisted size: {}",
        big_region,
        handle.get_size(target, &big_region).await?
    );

    // Proxy read into a buffer we expose ourselves.
    let sink = client.expose(vec![0u8; 16], BulkAccess::WriteOnly);
    let n = handle.proxy_read(target, &region, 0, &sink.bulk_ref()).await?;
    println!("Proxy read {} bytes: {}", n, String::from_utf8_lossy(&sink.to_vec()));

    handle.remove(target, &region).await?;
    handle.remove(target, &big_region).await?;

    println!("\nAsking the service to stop...");
    client.shutdown_service(endpoint).await?;

    Ok(())
}
