use anyhow::Context;
use clap::Parser;
use pidone_core::EnvMode;
use pidone_runner::environment::DEFAULT_SECRETS_DIR;
use pidone_runner::signals::block_signals;
use pidone_runner::{Supervisor, SupervisorConfig};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pidone")]
#[command(about = "Run one command as a container init: forward signals, reap zombies", long_about = None)]
struct Cli {
    /// Directory with one secret per file, exported to the child's environment
    #[arg(long, env = "PIDONE_SECRETS_DIR", default_value = DEFAULT_SECRETS_DIR)]
    secrets_dir: PathBuf,

    /// Whether secrets replace (replace) or extend (merge) the inherited environment
    #[arg(long, env = "PIDONE_ENV_MODE", default_value = "replace")]
    env_mode: EnvMode,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "PIDONE_LOG", default_value = "warn")]
    log_level: String,

    /// Do not register as child subreaper
    #[arg(long)]
    no_subreaper: bool,

    /// How long to wait for output to flush after the last descendant exits
    #[arg(long, default_value_t = 500)]
    drain_timeout_ms: u64,

    /// Command to supervise, followed by its arguments
    #[arg(
        value_name = "COMMAND",
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    command: Vec<String>,
}

impl Cli {
    fn supervisor_config(&self) -> anyhow::Result<SupervisorConfig> {
        let (program, args) = self
            .command
            .split_first()
            .context("COMMAND is required")?;

        let mut config = SupervisorConfig::new(program.clone(), args.to_vec());
        config.secrets_dir = self.secrets_dir.clone();
        config.env_mode = self.env_mode;
        config.subreaper = !self.no_subreaper;
        config.drain_timeout = Duration::from_millis(self.drain_timeout_ms);
        Ok(config)
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout belongs to the child
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .init();
}

async fn run(cli: &Cli) -> anyhow::Result<i32> {
    let config = cli.supervisor_config()?;
    let report = Supervisor::new(config)
        .run()
        .await
        .context("supervision failed")?;
    Ok(report.exit_code())
}

fn supervise(cli: &Cli) -> anyhow::Result<i32> {
    // Before any other thread exists, so every thread inherits the mask
    block_signals().context("failed to block signals")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(run(cli))
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let code = match supervise(&cli) {
        Ok(code) => code,
        Err(e) => {
            error!("Fatal error: {:#}", e);
            1
        }
    };

    // Relay threads still blocked on input are abandoned here
    process::exit(code);
}
