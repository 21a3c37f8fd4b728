//! CLI definition using clap derive.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use mocap_core::OutputMode;

#[derive(Parser)]
#[command(name = "mocap", about = "multi-camera fiducial marker tracker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the tracking pipeline, writing client points to stdout as NDJSON
    Run(RunOpts),
    /// Print an example pipeline config (JSON) with every default filled in
    InitConfig,
}

#[derive(clap::Args, Debug, Default)]
pub struct RunOpts {
    /// Pipeline config file (JSON). Built-in defaults when omitted.
    #[arg(long, short = 'c', env = "MOCAP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Projection plane: xy (floor plan) or xz (elevation)
    #[arg(long)]
    pub mode: Option<OutputMode>,

    /// Client world bounds
    #[arg(
        long,
        num_args = 4,
        allow_negative_numbers = true,
        value_names = ["MIN_X", "MAX_X", "MIN_Y", "MAX_Y"]
    )]
    pub bounds: Option<Vec<f64>>,

    /// World point mapped to the client origin
    #[arg(long, num_args = 3, allow_negative_numbers = true, value_names = ["X", "Y", "Z"])]
    pub origin: Option<Vec<f64>>,

    /// Rounding increment for client coordinates
    #[arg(long)]
    pub round: Option<f64>,

    /// Directory for the pose history CSV
    #[arg(long)]
    pub save_dir: Option<PathBuf>,

    /// Restart recordings from the top instead of stopping at the end
    #[arg(long = "loop")]
    pub loop_replay: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_opts(args: &[&str]) -> RunOpts {
        let argv = std::iter::once("mocap").chain(std::iter::once("run")).chain(args.iter().copied());
        match Cli::try_parse_from(argv).expect("parse").command {
            Command::Run(opts) => opts,
            Command::InitConfig => panic!("expected run"),
        }
    }

    #[test]
    fn run_defaults() {
        let opts = run_opts(&[]);
        assert!(opts.mode.is_none());
        assert!(opts.bounds.is_none());
        assert!(!opts.loop_replay);
    }

    #[test]
    fn parses_negative_bounds_and_origin() {
        let opts = run_opts(&[
            "--bounds", "-100", "100", "-50", "50", "--origin", "0", "-10", "5", "--mode", "xz",
        ]);
        assert_eq!(opts.bounds, Some(vec![-100.0, 100.0, -50.0, 50.0]));
        assert_eq!(opts.origin, Some(vec![0.0, -10.0, 5.0]));
        assert_eq!(opts.mode, Some(OutputMode::Xz));
    }

    #[test]
    fn rejects_unknown_mode() {
        assert!(Cli::try_parse_from(["mocap", "run", "--mode", "yz"]).is_err());
    }

    #[test]
    fn bounds_need_four_values() {
        assert!(Cli::try_parse_from(["mocap", "run", "--bounds", "1", "2", "3"]).is_err());
    }

    #[test]
    fn init_config_subcommand() {
        let cli = Cli::try_parse_from(["mocap", "init-config"]).expect("parse");
        assert!(matches!(cli.command, Command::InitConfig));
    }
}
