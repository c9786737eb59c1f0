use clap::Parser;
use range_lease::cli::{self, Cli};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbosity {
        0 => "range_lease=info,warn",
        1 => "range_lease=debug,info",
        _ => "range_lease=trace,debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let report = cli::run(&cli).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
