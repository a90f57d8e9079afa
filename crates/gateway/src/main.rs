use clap::Parser;
use edge_gateway::cli::{Cli, execute};

fn main() {
    if let Err(err) = execute(Cli::parse()) {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}
