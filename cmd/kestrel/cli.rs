use clap::{ArgAction, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kestrel", author, version, about = "kestrel ocap kernel")]
pub struct Cli {
    #[command(flatten)]
    pub opts: Options,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Parser, Debug, Clone)]
pub struct Options {
    #[arg(
        long = "datadir",
        value_name = "DATABASE_DIRECTORY",
        default_value = "memory",
        help = "Directory holding the kernel database.",
        long_help = "If the datadir is the word `memory`, kestrel keeps all state in memory and nothing survives exit. Any other value names a RocksDB directory (requires the `rocksdb` build feature).",
        help_heading = "Kernel options",
        env = "KESTREL_DATADIR"
    )]
    pub datadir: PathBuf,
    #[arg(
        long = "config",
        value_name = "SUBCLUSTER_CONFIG_PATH",
        help = "JSON subcluster config to launch at startup.",
        help_heading = "Kernel options",
        env = "KESTREL_CONFIG"
    )]
    pub config: Option<PathBuf>,
    #[arg(
        long = "log.level",
        value_name = "LOG_LEVEL",
        default_value = "info",
        help = "Log filter directive, same syntax as RUST_LOG.",
        help_heading = "Kernel options",
        env = "KESTREL_LOG_LEVEL"
    )]
    pub log_level: String,
    #[arg(
        long = "listen",
        value_name = "ADDRESS",
        help = "Enable remote comms, listening on this address (e.g. 127.0.0.1:9631).",
        help_heading = "Comms options",
        env = "KESTREL_LISTEN"
    )]
    pub listen: Option<SocketAddr>,
    #[arg(
        long = "key-seed",
        value_name = "SEED",
        help = "Deterministic peer identity seed; omit for a fresh key pair.",
        help_heading = "Comms options",
        env = "KESTREL_KEY_SEED"
    )]
    pub key_seed: Option<String>,
    #[arg(
        long = "force-reset",
        action = ArgAction::SetTrue,
        help = "Discard persisted state for the launched subcluster before starting.",
        help_heading = "Kernel options",
        env = "KESTREL_FORCE_RESET"
    )]
    pub force_reset: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the kernel (the default when no subcommand is given).
    Run,
    /// Print the kernel status record as JSON and exit.
    Status,
}
