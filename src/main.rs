#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::{path::Path, sync::Arc};

use clap::Parser;
use pfcp_lb::config::{Cli, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let path = Path::new(&cli.config);
    let config = if path.exists() {
        Config::from_file(path)?
    } else if cli.config == "upf.json" {
        // The conventional path is optional; everything has a default.
        Config::default()
    } else {
        anyhow::bail!("config file not found: {}", cli.config);
    };

    simple_logger::init_with_level(config.log_level.as_level())?;
    pfcp_lb::server_main(Arc::new(config), cli.simulate).await
}
