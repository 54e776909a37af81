use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "development process supervisor")]
pub struct Args {
    /// Sub‑commands (run, status, stop)
    #[command(subcommand)]
    pub sub: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Supervise the configured services until signalled (default if no sub‑command)
    Run {
        /// Path to configuration file (SUPERVISOR_CONFIG takes precedence)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
    /// Print one line per service (Exit 0 = all Ready, 1 = any Dead,
    /// 2 = any Unhealthy, 3 = still starting, 4 = supervisor unreachable)
    Status {
        /// Path to configuration file, used to locate the control socket
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Control socket of the running supervisor
        #[arg(long, short = 's')]
        socket: Option<PathBuf>,
    },
    /// Ask a running supervisor to shut down (Exit 0 = accepted, 4 = unreachable)
    Stop {
        /// Path to configuration file, used to locate the control socket
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Control socket of the running supervisor
        #[arg(long, short = 's')]
        socket: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_invocation_has_no_subcommand() {
        let args = Args::try_parse_from(["devsup"]).unwrap();
        assert!(args.sub.is_none());
    }

    #[test]
    fn status_accepts_socket_override() {
        let args = Args::try_parse_from(["devsup", "status", "--socket", "/tmp/x.sock"]).unwrap();
        match args.sub {
            Some(Cmd::Status { socket, config }) => {
                assert_eq!(socket, Some(PathBuf::from("/tmp/x.sock")));
                assert!(config.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn run_takes_short_config_flag() {
        let args = Args::try_parse_from(["devsup", "run", "-c", "dev.toml"]).unwrap();
        assert!(matches!(
            args.sub,
            Some(Cmd::Run { config: Some(ref p) }) if p == &PathBuf::from("dev.toml")
        ));
    }
}
