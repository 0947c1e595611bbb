//! CLI entry point (§A "Ambient stack").

use clap::Parser;
use testbroker::config::Config;
use testbroker::lifecycle::Lifecycle;

/// Ephemeral key/value and lease broker over a local Unix domain socket.
#[derive(Parser, Debug)]
#[command(name = "testbrokerd", version, about)]
struct Args {
    /// Override the random endpoint path suffix (same as BROKER_PIPE_ID).
    #[arg(long)]
    pipe_id: Option<String>,

    /// Increase log verbosity; repeat for more (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Launch this command after starting and supervise its exit.
    #[arg(long)]
    spawn: Option<String>,

    /// Arguments passed through to the spawned command.
    #[arg(long = "spawn-arg")]
    spawn_args: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::from_env();
    if let Some(pipe_id) = args.pipe_id {
        config.pipe_id = Some(pipe_id);
    }
    match args.verbose {
        0 => {}
        1 => config.log_level = "debug".to_string(),
        _ => config.log_level = "trace".to_string(),
    }

    testbroker::logging::init(&config);

    let mut lifecycle = Lifecycle::new(config);
    lifecycle.start().await?;

    if let Some(command) = args.spawn.as_deref() {
        lifecycle.spawn_child(command, &args.spawn_args)?;
    }

    let exit_code = lifecycle.run_until_shutdown().await?;
    std::process::exit(exit_code);
}
