//! Run the full shelf pipeline on a local image and print the items as JSON
//! Run with: cargo run --release --bin analyze_image -- <image_path>

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use shelf_vision::{BatchOrchestrator, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("shelf_vision=info,ort=off")
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let Some(image_path) = std::env::args().nth(1) else {
        eprintln!("Usage: analyze_image <image_path>");
        std::process::exit(2);
    };

    if !Path::new(&image_path).exists() {
        eprintln!("Image not found: {}", image_path);
        std::process::exit(1);
    }

    let config = Arc::new(Config::new()?);
    let orchestrator = BatchOrchestrator::new(config).await?;

    let bytes = tokio::fs::read(&image_path)
        .await
        .with_context(|| format!("Failed to read {}", image_path))?;
    info!("Loaded {} ({} bytes)", image_path, bytes.len());

    let items = orchestrator.analyze_upload(bytes).await?;
    println!("{}", serde_json::to_string_pretty(&items)?);

    let failed = items.iter().filter(|item| item.is_error()).count();
    info!("{} items, {} failed", items.len(), failed);

    Ok(())
}
