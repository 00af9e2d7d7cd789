use std::path::PathBuf;
use tracing::error;

use inbox_sync_lib::config::{load_config, load_config_from_path};

#[tokio::main]
async fn main() {
    inbox_sync_lib::init_tracing();

    // Optional first argument: path to a config file
    let config = match std::env::args().nth(1) {
        Some(path) => load_config_from_path(&PathBuf::from(path)),
        None => load_config(),
    };

    let result = match config {
        Ok(config) => inbox_sync_lib::run(config).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}
