//! Command line interface.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "job-runner", version, about = "Background job dispatcher")]
pub struct Args {
    /// Override the listener port
    #[arg(long, global = true, env = "JOB_RUNNER_PORT")]
    pub port: Option<u16>,

    /// Directory for log files
    #[arg(long, global = true, env = "LOG_DIR")]
    pub log_dir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Run the dispatch loop and the notify listener until interrupted
    Serve,
    /// Process every claimable job once, printing progress as it happens
    Drain,
}

impl Args {
    pub fn command(&self) -> Commands {
        self.command.unwrap_or(Commands::Serve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_is_the_default() {
        let args = Args::try_parse_from(["job-runner"]).unwrap();
        assert_eq!(args.command(), Commands::Serve);
    }

    #[test]
    fn parses_drain_with_global_flags() {
        let args = Args::try_parse_from(["job-runner", "drain", "--port", "7100"]).unwrap();
        assert_eq!(args.command(), Commands::Drain);
        assert_eq!(args.port, Some(7100));
    }
}
