pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "flowacct")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Network flow accounting collector", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Log filter, overridden by RUST_LOG")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Run the collector")]
    Run {
        #[arg(short, long, help = "Configuration file")]
        config: PathBuf,

        #[arg(short, long, help = "JSON lines flow input (stdin when absent)")]
        input: Option<PathBuf>,
    },
    #[command(about = "Validate a configuration file")]
    CheckConfig {
        #[arg(short, long, help = "Configuration file")]
        config: PathBuf,
    },
    #[command(about = "Inspect or replay recovery logs")]
    Recovery {
        #[command(subcommand)]
        action: RecoveryAction,
    },
}

#[derive(Subcommand)]
pub enum RecoveryAction {
    #[command(about = "Print the entries of a recovery log as JSON lines")]
    Dump {
        #[arg(help = "Recovery log file")]
        file: PathBuf,
    },
    #[command(about = "Write the entries of a recovery log to a plugin's backend")]
    Replay {
        #[arg(help = "Recovery log file")]
        file: PathBuf,

        #[arg(short, long, help = "Configuration file")]
        config: PathBuf,

        #[arg(short, long, help = "Plugin whose backend receives the entries")]
        plugin: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from(["flowacct", "-v", "run", "--config", "flowacct.yaml"]);
        assert!(cli.verbose);
        match cli.command {
            Some(Commands::Run { config, input }) => {
                assert_eq!(config, PathBuf::from("flowacct.yaml"));
                assert!(input.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_recovery_replay() {
        let cli = Cli::parse_from([
            "flowacct",
            "recovery",
            "replay",
            "acct.log",
            "--config",
            "c.yaml",
            "--plugin",
            "acct",
        ]);
        match cli.command {
            Some(Commands::Recovery {
                action: RecoveryAction::Replay { file, plugin, .. },
            }) => {
                assert_eq!(file, PathBuf::from("acct.log"));
                assert_eq!(plugin, "acct");
            }
            _ => panic!("expected recovery replay"),
        }
    }
}
