use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dmxflow")]
#[command(about = "DMX512 output over USB interfaces", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Output config file (TOML). Defaults to the user config directory.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Use N virtual serial interfaces instead of real hardware
    #[arg(long, value_name = "N", global = true)]
    pub loopback: Option<usize>,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, default_value = "warn", global = true)]
    pub log_level: String,

    /// Also write logs to this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List detected outputs
    List,

    /// Show plugin status, or details of one output
    Info {
        /// Output number (1-based)
        #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
        output: Option<u32>,
    },

    /// Set one channel on an output and hold it
    Send {
        /// Output number (1-based)
        #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
        output: u32,

        /// DMX channel (1-512)
        #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..=512))]
        channel: u32,

        /// Channel value (0-255)
        #[arg(short, long)]
        value: u8,

        /// How long to keep transmitting, in milliseconds
        #[arg(long, default_value = "2000")]
        hold_ms: u64,
    },

    /// Inspect or edit the universe patch
    Patch {
        /// Patch file (.ron or .json). Defaults to the user config directory.
        #[arg(short, long, global = true)]
        file: Option<PathBuf>,

        #[command(subcommand)]
        action: PatchAction,
    },

    /// Inspect or initialize the output config
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum PatchAction {
    /// Print the patch table
    Show,

    /// Route a universe to a plugin output and save
    Set {
        /// Universe number (1-based)
        #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
        universe: u32,

        /// Plugin name, or "None" to unpatch
        #[arg(short, long, default_value = "USB DMX Output")]
        plugin: String,

        /// Output number (1-based)
        #[arg(short, long, default_value = "1", value_parser = clap::value_parser!(u32).range(1..))]
        output: u32,
    },

    /// Write the current patch to another file
    Save {
        /// Destination (.ron or .json)
        path: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective config as TOML
    Show,

    /// Write the default config to the config path
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
