use anyhow::Context;
use clap::Parser;
use cli::{ConfigArgs, ConfigCommand};
use tokio_util::sync::CancellationToken;

use rackmon_agent::{config, init_logger};

const BINARY: &str = env!("CARGO_BIN_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();
    init_logger(args.common.debug, args.common.trace);
    print_welcome();

    // Run CLI commands that do not need the full agent.
    if run_command(&args)? {
        return Ok(());
    }

    let mut settings = config::load(&args.common.config, !args.common.no_default_config)
        .with_context(|| format!("could not load configuration file {}", args.common.config))?;

    // CLI flags win over the [agent] section.
    settings.agent.debug |= args.common.debug;
    settings.agent.trace |= args.common.trace;

    anyhow::ensure!(
        !settings.inputs.is_empty(),
        "no inputs are configured, there is nothing to collect"
    );
    anyhow::ensure!(
        !settings.outputs.is_empty(),
        "no outputs are configured, there is nowhere to write"
    );
    let output = config::combine_outputs(settings.outputs);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("cannot start the async runtime")?;
    runtime.block_on(async {
        // Ctrl+C stops the inputs; the agent drains what they published and
        // then returns.
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    log::info!("Shutdown requested, stopping the inputs.");
                    trigger.cancel();
                }
                Err(e) => log::error!("cannot listen for Ctrl+C: {e}"),
            }
        });
        rackmon::agent::run(settings.agent, settings.global_tags, settings.inputs, output, shutdown).await
    })?;

    log::info!("{BINARY} has stopped.");
    Ok(())
}

/// Prints a short welcome message.
fn print_welcome() {
    // It is useful to have the precise version of the agent in the logs.
    log::info!("Starting {BINARY} v{VERSION}");

    // Print a warning if we are running in debug mode.
    #[cfg(debug_assertions)]
    {
        log::warn!("DEBUG assertions are enabled, this build is fine for debugging, but not for production.");
    }
}

/// If selected by the CLI user, runs a command that does not need the
/// collection pipeline.
///
/// Returns `true` if a command was run (in which case you probably should stop here).
fn run_command(args: &cli::Cli) -> anyhow::Result<bool> {
    match args.command {
        Some(cli::Command::Config(ConfigArgs {
            command: ConfigCommand::Regen,
        })) => {
            let file = &args.common.config;
            std::fs::write(file, config::DEFAULT_CONFIG).with_context(|| format!("cannot write {file}"))?;
            log::info!("Default configuration file written to: {file}");
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Agent command-line interface (CLI).
///
/// We use `clap` to parse these options, therefore the structs
/// derive [`clap::Parser`] or other clap trait implementations.
mod cli {
    use clap::{Args, Parser, Subcommand};

    // NOTE: the doc comment attached to `Cli` is used by clap as the description of
    // the application. It is displayed at the start of the help message.

    /// Collects telemetry from rack equipment and local services.
    #[derive(Parser)]
    #[command(version)]
    pub struct Cli {
        #[command(subcommand)]
        pub command: Option<Command>,

        #[command(flatten)]
        pub common: CommonArgs,
    }

    #[derive(Subcommand)]
    pub enum Command {
        /// Run the agent and collect metrics.
        ///
        /// This is the default command.
        Run,

        /// Manipulate the configuration.
        Config(ConfigArgs),
    }

    #[derive(Args)]
    pub struct ConfigArgs {
        #[command(subcommand)]
        pub command: ConfigCommand,
    }

    #[derive(Subcommand)]
    pub enum ConfigCommand {
        /// Regenerate the configuration file and stop.
        ///
        /// If the file exists, it will be overwritten.
        Regen,
    }

    /// Common CLI arguments.
    #[derive(Args, Clone)]
    pub struct CommonArgs {
        /// Path to the config file.
        #[arg(long, env = "RACKMON_CONFIG", default_value = "rackmon.toml")]
        pub config: String,

        /// If set, the config file must exist, otherwise the agent will fail to start with an error.
        #[arg(long, default_value_t = false)]
        pub no_default_config: bool,

        /// Log a diagnostic for every field value dropped during normalization.
        #[arg(long)]
        pub debug: bool,

        /// Echo every published point to the log.
        #[arg(long)]
        pub trace: bool,
    }
}
