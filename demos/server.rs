//! Run a storage service with one provider and one target.
//!
//! Usage: `cargo run --example server -- [bind_addr] [pool_dir]`

use silo::{ProviderConfig, Service, ServiceConfig};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("silo=debug,info")
        .init();

    let mut args = std::env::args().skip(1);
    let bind_addr = args.next().unwrap_or_else(|| "127.0.0.1:7400".to_string());
    let pool_dir = PathBuf::from(args.next().unwrap_or_else(|| "./silo-data".to_string()));
    std::fs::create_dir_all(&pool_dir)?;

    let config = ServiceConfig::new(bind_addr.parse()?).with_remote_shutdown(true);
    let service = Service::start(config).await?;
    let provider = service.add_provider(1, ProviderConfig::default())?;

    // Reuse the pool from a previous run if there is one.
    let pool_path = pool_dir.join("target-0.pool");
    let target = if pool_path.exists() {
        provider.attach_target(&pool_path)?
    } else {
        provider.create_target(&pool_path, 64 * 1024 * 1024)?
    };

    println!("Service listening on {}", service.endpoint());
    println!("Provider 1 target: {}", target);
    println!("Press Ctrl-C or run the client example to stop.");

    tokio::select! {
        result = service.wait() => result?,
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
            service.shutdown().await?;
        }
    }

    Ok(())
}
