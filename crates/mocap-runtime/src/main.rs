//! mocap: multi-camera fiducial marker tracker.
//! Runs one capture worker per camera, fuses marker positions and streams
//! 2D client points to stdout.

use clap::Parser;

mod cli;
mod config_file;
mod pipeline;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    match args.command {
        cli::Command::Run(opts) => {
            let filter = std::env::var("MOCAP_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string());
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                .with_writer(std::io::stderr)
                .init();

            let config = config_file::resolve(&opts)?;
            tracing::info!(
                cameras = config.cameras.len(),
                mode = %config.output.mode,
                "mocap starting"
            );
            pipeline::run(config, opts.loop_replay).await?;
        }
        cli::Command::InitConfig => {
            println!("{}", config_file::example_config_json()?);
        }
    }

    Ok(())
}
