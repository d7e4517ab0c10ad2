//! Main entry point for the SQRL mining daemon.

use clap::Parser;

use sqrl_miner::{config::Opts, daemon::Daemon, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let opts = Opts::parse();
    let dummy_work = opts.dummy_work;
    let daemon = Daemon::new(opts.into_settings(), dummy_work);
    daemon.run().await
}
