use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::Verbosity;

mod command;
mod config;
mod sys;

#[derive(Debug, clap::Parser)]
#[command(name = "burrow", version)]
#[command(about = "Expose private WebSocket services through a public gateway.", long_about = None)]
pub struct Cli {
    #[clap(flatten)]
    verbose: clap_verbosity_flag::Verbosity,

    /// Configuration file (default: <config dir>/burrow/config.toml)
    #[arg(long, global = true, env = "BURROW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: command::Command,
}

fn init_logger_env(verbosity: &Verbosity) {
    use tracing::level_filters::LevelFilter;

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("BURROW_LOG")
        .from_env_lossy();

    tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(match (verbosity.is_present(), verbosity.is_silent()) {
            (false, _) => env_filter,
            (true, true) => env_filter.add_directive(LevelFilter::OFF.into()),
            (true, false) => {
                let level_filter = match verbosity.log_level_filter() {
                    clap_verbosity_flag::LevelFilter::Off => LevelFilter::OFF,
                    clap_verbosity_flag::LevelFilter::Error => LevelFilter::ERROR,
                    clap_verbosity_flag::LevelFilter::Warn => LevelFilter::WARN,
                    clap_verbosity_flag::LevelFilter::Info => LevelFilter::INFO,
                    clap_verbosity_flag::LevelFilter::Debug => LevelFilter::DEBUG,
                    clap_verbosity_flag::LevelFilter::Trace => LevelFilter::TRACE,
                };
                env_filter.add_directive(level_filter.into())
            }
        })
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger_env(&cli.verbose);

    let config = config::Config::load(cli.config.as_deref())?;

    match &cli.command {
        command::Command::Gateway(args) => command::gateway::execute(args, config).await?,
        command::Command::Agent(args) => command::agent::execute(args, config).await?,
    }

    Ok(())
}
