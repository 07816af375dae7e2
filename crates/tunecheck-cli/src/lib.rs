//! tunecheck CLI library

pub mod commands;
pub mod error;
pub mod harness;

pub use error::{Error, Result};

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// tunecheck - power-management and operator validation for single-node OpenShift
#[derive(Parser, Debug)]
#[command(name = "tunecheck")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every suite
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Suite configuration file (falls back to TUNECHECK_CONFIG, then defaults)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Kubeconfig of the cluster under test (falls back to
    /// TUNECHECK_KUBECONFIG, then the kube defaults)
    #[arg(long, global = true)]
    pub kubeconfig: Option<String>,

    /// Deadline in seconds for the apply and verification phase of each
    /// scenario
    #[arg(long, global = true)]
    pub deadline_secs: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the power-management scenarios
    Power(commands::power::PowerArgs),
    /// Check the MetalLB operator installation
    Metallb,
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Power(args) => commands::power::run(&self.global, args).await,
            Commands::Metallb => commands::metallb::run(&self.global).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commands::power::PowerScenario;

    #[test]
    fn power_defaults_to_every_scenario_and_literal_frequencies() {
        let cli = Cli::try_parse_from(["tunecheck", "power"]).expect("parses");
        match cli.command {
            Commands::Power(args) => {
                assert!(args.scenarios.is_empty());
                assert_eq!(args.isolated_freq, 2_200_002);
                assert_eq!(args.reserved_freq, 2_500_002);
            }
            other => panic!("Expected power, got {other:?}"),
        }
    }

    #[test]
    fn global_flags_work_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "tunecheck",
            "power",
            "--scenario",
            "per-pod-power-states",
            "--scenario",
            "frequency-tuning",
            "--kubeconfig",
            "/tmp/kc",
            "--deadline-secs",
            "900",
        ])
        .expect("parses");

        assert_eq!(cli.global.kubeconfig.as_deref(), Some("/tmp/kc"));
        assert_eq!(cli.global.deadline_secs, Some(900));
        match cli.command {
            Commands::Power(args) => assert_eq!(
                args.scenarios,
                vec![PowerScenario::PerPodPowerStates, PowerScenario::FrequencyTuning]
            ),
            other => panic!("Expected power, got {other:?}"),
        }
    }

    #[test]
    fn metallb_takes_no_arguments() {
        let cli = Cli::try_parse_from(["tunecheck", "--config", "suite.yaml", "metallb"])
            .expect("parses");
        assert!(matches!(cli.command, Commands::Metallb));
        assert_eq!(cli.global.config, Some(PathBuf::from("suite.yaml")));
        assert!(Cli::try_parse_from(["tunecheck", "metallb", "--scenario", "x"]).is_err());
    }
}
