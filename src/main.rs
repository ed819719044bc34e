use clap::Parser;

use tvwarden::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = cli.run().await {
        log::error!("fatal: {}", err);
        std::process::exit(1);
    }
}
