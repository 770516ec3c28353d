use clap::{Args, Parser, Subcommand};
use skiff_core::state::DEFAULT_STATE_FILE;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "skiff")]
#[command(about = "Mirror a local directory tree onto a remote one through a spawned helper")]
pub struct Cli {
    /// Verbose protocol and progress logging
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a state file treating the current tree as already synced
    Genstate(StateArgs),
    /// Write a state file treating the current tree as entirely new
    Genemptystate(StateArgs),
    /// Bring the remote tree up to date with the local one
    Sync(SyncArgs),
    /// Serve the remote side of a sync over stdin/stdout
    Server,
}

#[derive(Args, Clone, Debug)]
pub struct StateArgs {
    /// Directory to be synced (default: current directory)
    #[arg(long)]
    pub cwd: Option<PathBuf>,
    /// State file name, resolved at the root of the synced tree
    #[arg(long, default_value = DEFAULT_STATE_FILE)]
    pub statefile: String,
}

#[derive(Args, Clone, Debug)]
pub struct SyncArgs {
    #[command(flatten)]
    pub common: StateArgs,
    /// List what would be deleted and uploaded, then exit without syncing
    #[arg(long)]
    pub dryrun: bool,
}
