//! Two in-process services: move a region, then a whole target.

use silo::{Client, ClientConfig, ProviderConfig, Service, ServiceConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("silo=info")
        .init();

    let dir = std::env::temp_dir().join(format!("silo-migration-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;

    let east = Service::start(ServiceConfig::default()).await?;
    let west = Service::start(ServiceConfig::default()).await?;
    let east_provider = east.add_provider(1, ProviderConfig::default())?;
    let west_provider = west.add_provider(2, ProviderConfig::default())?;

    let east_target = east_provider.create_target(dir.join("east.pool"), 1 << 20)?;
    let west_target = west_provider.create_target(dir.join("west.pool"), 1 << 20)?;

    let client = Client::new(ClientConfig::default()).await?;
    let east_handle = client.provider_handle(east.endpoint(), 1);
    let west_handle = client.provider_handle(west.endpoint(), 2);

    let region = east_handle
        .create_write_persist(east_target, 64, b"travelling region")
        .await?;

    println!("--- Region migration ---");
    let moved = east_handle
        .migrate_region(east_target, &region, west.endpoint(), 2, west_target, true)
        .await?;
    let data = west_handle.read(west_target, &moved, 0, 17).await?;
    println!("{} -> {}: {}", region, moved, String::from_utf8_lossy(&data));

    println!("\n--- Target migration ---");
    let kept = east_handle
        .create_write_persist(east_target, 64, b"travelling target")
        .await?;
    let target = east_handle
        .migrate_target(east_target, west.endpoint(), 2, dir.join("west-incoming"), true)
        .await?;
    println!("Target {} now on west: {:?}", target, west_handle.probe(None).await?);
    let data = west_handle.read(target, &kept, 0, 17).await?;
    println!("Region {}: {}", kept, String::from_utf8_lossy(&data));

    let metrics = east_provider.metrics();
    println!(
        "\nEast migrations: {} region(s), {} target(s), {} failure(s)",
        metrics.region_migrations, metrics.target_migrations, metrics.migration_failures
    );

    east.shutdown().await?;
    west.shutdown().await?;
    std::fs::remove_dir_all(&dir)?;
    Ok(())
}
