//! Command-line flags, parsed with `clap`'s derive API.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Strategy {
    Adapt,
    Jit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Metric {
    Ipc,
    Calls,
}

#[derive(Parser, Debug)]
#[command(
    name = "halo-server",
    version,
    about = "Online profile-guided recompilation server",
    long_about = "halo-server — accepts client enrollments, profiles running processes, \
                  and adaptively recompiles hot functions against tuned knob configurations."
)]
pub struct Cli {
    /// Path to the JSON server configuration file (serverSettings + knobs/loopKnobs).
    pub config: PathBuf,

    /// TCP port to listen on.
    #[arg(long = "halo-port", default_value_t = 4848)]
    pub port: u16,

    /// Tokio worker thread count (0 = let the runtime choose).
    #[arg(long = "halo-threads", default_value_t = 0)]
    pub threads: usize,

    /// Exit once every connected client has disconnected, instead of
    /// waiting indefinitely for new enrollments.
    #[arg(long = "halo-no-persist")]
    pub no_persist: bool,

    /// Tuning strategy a new client group runs.
    #[arg(long = "halo-strategy", value_enum, default_value_t = Strategy::Adapt)]
    pub strategy: Strategy,

    /// Performance metric driving the bakeoff comparison.
    #[arg(long = "halo-metric", value_enum, default_value_t = Metric::Ipc)]
    pub metric: Metric,

    /// Force-merge the two versions of a timed-out bakeoff rather than
    /// keeping them both around.
    #[arg(long = "halo-forcemerge")]
    pub forcemerge: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_select_adapt_strategy_and_ipc_metric() {
        let cli = Cli::parse_from(["halo-server", "server.json"]);
        assert_eq!(cli.strategy, Strategy::Adapt);
        assert_eq!(cli.metric, Metric::Ipc);
        assert_eq!(cli.port, 4848);
        assert!(!cli.no_persist);
        assert!(!cli.forcemerge);
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "halo-server",
            "server.json",
            "--halo-port",
            "9000",
            "--halo-strategy",
            "jit",
            "--halo-metric",
            "calls",
            "--halo-forcemerge",
            "--halo-no-persist",
        ]);
        assert_eq!(cli.port, 9000);
        assert_eq!(cli.strategy, Strategy::Jit);
        assert_eq!(cli.metric, Metric::Calls);
        assert!(cli.forcemerge);
        assert!(cli.no_persist);
    }

    #[test]
    fn rejects_unknown_strategy_value() {
        let result = Cli::try_parse_from(["halo-server", "server.json", "--halo-strategy", "bogus"]);
        assert!(result.is_err());
    }
}
