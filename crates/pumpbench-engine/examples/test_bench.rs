use std::sync::Arc;

use pumpbench_core::logging;
use pumpbench_engine::prelude::*;
use pumpbench_engine::TestBench;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Configuration file first, then PUMPBENCH__* overrides
    let path = std::env::args().nth(1).unwrap_or_else(|| "pumpbench.toml".to_string());
    let config = ConfigBuilder::new()
        .with_config_file(&path)
        .with_environment_prefix("PUMPBENCH")
        .build()?;
    logging::init_from_config(&config.logging)?;

    let sink = Arc::new(CsvRecordSink::new(&config.general.data_dir)?);
    let bus = SharedEventBus::new();
    let mut bench = TestBench::from_config(config, Arc::new(bus), sink)?;

    if let Err(e) = bench.start().await {
        error!("{:#}", e);
        return Err(e);
    }
    info!("Bench running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    bench.shutdown().await;
    Ok(())
}
