mod agent;
mod backend;
mod cli;
mod cmd;
mod command;
mod config;
mod host;
mod logger;
mod prompt;
mod provision;
mod registry;

use anyhow::Result;
use tracing::{error, info};

fn main() -> Result<()> {
    logger::init()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        args = ?std::env::args().skip(1).collect::<Vec<_>>(),
        "agentbox start"
    );

    match cli::run() {
        Ok(result) => {
            info!("agentbox finished successfully");
            Ok(result)
        }
        Err(err) => {
            error!(error = ?err, "agentbox failed");
            Err(err)
        }
    }
}
