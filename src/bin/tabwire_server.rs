use std::{error::Error, net::SocketAddr, path::PathBuf, process, sync::Arc};

use clap::Parser;
use log::{error, info};
use tabwire::{MemoryEngine, StorageEngine, StorageServer, config::ServerConfig};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to storage directory
    path: PathBuf,
    /// Listen for new connection at address
    address: SocketAddr,
    #[command(flatten)]
    server: ServerConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    if !cli.path.is_dir() {
        return Err(format!("'{}' is not a directory", cli.path.display()).into());
    }

    let engine = Arc::new(MemoryEngine::open(&cli.path)?);
    let on_interrupt = Arc::clone(&engine);
    ctrlc::set_handler(move || {
        info!("interrupted, committing");
        let code = match on_interrupt.commit() {
            Ok(()) => 0,
            Err(e) => {
                error!("commit on shutdown failed: {e}");
                1
            }
        };
        process::exit(code);
    })?;

    let server = StorageServer::bind(cli.address, engine, &cli.server)?;
    server.listen()?;
    Ok(())
}
