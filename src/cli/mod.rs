pub mod commands;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "topowatch")]
#[command(author = "topowatch contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Network topology and flow visibility: analyzer, agent and all-in-one supervisor", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Configuration source, forwarded unchanged to supervised children
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    #[arg(
        short = 'c',
        long = "conf",
        global = true,
        help = "Configuration file, may be repeated"
    )]
    pub files: Vec<PathBuf>,

    #[arg(
        short = 'b',
        long = "backend",
        global = true,
        help = "Configuration backend (file)"
    )]
    pub backend: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Run analyzer and agent on this host (requires root)")]
    Allinone {
        #[arg(long, help = "uid the analyzer runs as (default: owner of this executable)")]
        analyzer_uid: Option<u32>,
    },
    #[command(about = "Run the analyzer API")]
    Analyzer,
    #[command(about = "Run the host agent")]
    Agent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_argv_parses() {
        let cli = Cli::try_parse_from([
            "topowatch",
            "-c",
            "/etc/a.yml",
            "-c",
            "/etc/b.yml",
            "-b",
            "file",
            "analyzer",
        ])
        .unwrap();
        assert_eq!(
            cli.config.files,
            vec![PathBuf::from("/etc/a.yml"), PathBuf::from("/etc/b.yml")]
        );
        assert_eq!(cli.config.backend.as_deref(), Some("file"));
        assert!(matches!(cli.command, Some(Commands::Analyzer)));
    }

    #[test]
    fn test_allinone_uid_flag() {
        let cli = Cli::try_parse_from(["topowatch", "allinone", "--analyzer-uid", "1000", "-v"])
            .unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Some(Commands::Allinone {
                analyzer_uid: Some(1000)
            })
        ));
    }
}
