use clap::Parser;
use poolserver::cli::{run_cli, Cli};
use poolserver::logging::{init_logging_with_config, LogConfig};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _logging = init_logging_with_config(&LogConfig::from_env())?;
    run_cli(cli)
}
