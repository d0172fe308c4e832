use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "kvmap",
    about = "kvmap: object persistence over key-value stores",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the author/book scenario against the in-memory backend
    Demo(DemoArgs),
    /// Inspect datastore configuration files
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct DemoArgs {
    /// Number of books to give the author
    #[arg(short, long, default_value = "3")]
    pub books: usize,
    /// Load the book collection together with its author
    #[arg(long)]
    pub eager: bool,
    /// Datastore configuration file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Parse a configuration file and print the effective settings
    Check { path: PathBuf },
    /// Print the default configuration
    Show,
}
