//! Formulary CLI: fetch, build, and install packages from descriptor catalogs.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "formulary",
    version,
    about = "Declarative package builds: fetch, build, install, verify with BLAKE3 receipts"
)]
struct Cli {
    #[command(subcommand)]
    command: formulary::cli::Commands,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = formulary::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
