mod cli;
mod commands;

use crate::cli::{Cli, Commands};
use clap::Parser;
use eyre::Result;

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    skiff_core::logger::init(cli.verbose);

    match cli.command {
        Commands::Genstate(args) => commands::run_genstate(&args, false),
        Commands::Genemptystate(args) => commands::run_genstate(&args, true),
        Commands::Sync(args) => commands::run_sync(&args),
        Commands::Server => commands::run_server(),
    }
}
