use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Args, FromArgMatches};
use palantiri::{EngineBuilder, Resolver};
use palantiri_agent::{
    build_observers,
    command::run_commands,
    config::{AgentConfig, Format},
    init_logger,
};

const BINARY: &str = env!("CARGO_BIN_NAME");

/// How long to wait for the engine's loops on shutdown.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Main agent function.
///
/// The steps are:
/// - parse the CLI
/// - parse the config file
/// - apply the settings from CLI and config file
/// - start the engine
/// - read commands from the standard input until `exit` or the end of the input
///
/// About errors: we use `anyhow::Result` and `context` instead of `expect` to get
/// nicer error messages (`expect` prints errors with `Debug`).
fn main() -> anyhow::Result<()> {
    init_logger();

    // Define the command-line interface.
    let mut cmd = clap::Command::new(BINARY).version(agent_version());
    cmd = cli::Cli::augment_args(cmd);

    // Parse CLI arguments and handle some special flags like --version and --help.
    let matches = cmd.get_matches();
    let mut args = match cli::Cli::from_arg_matches(&matches) {
        Ok(args) => args,
        Err(e) => e.exit(),
    };

    // Special flags like --help will exit. In other cases, we continue.
    print_welcome();

    let config_path = Path::new(&args.common.config);

    // Only the `run` command reads the config file.
    match args.command.take().unwrap_or(cli::Command::Run) {
        cli::Command::Config(cli::ConfigArgs {
            command: cli::ConfigCommand::Regen,
        }) => {
            AgentConfig::default().save(config_path)?;
            log::info!("Default configuration file written to: {}", config_path.display());
            Ok(())
        }
        cli::Command::Counters(cli::CountersArgs {
            command: cli::CountersCommand::List,
        }) => {
            let resolver = create_resolver().context("could not initialize the counters")?;
            let available = resolver.list_available().context("could not list the counters")?;
            println!("Available counters:");
            for id in available {
                println!("- {id}");
            }
            Ok(())
        }
        cli::Command::Run => {
            // parse config file
            let mut config = AgentConfig::load(config_path, !args.common.no_default_config)
                .context("could not load config file")?;
            apply_overrides(&args.common, &mut config);

            let resolver = create_resolver().context("could not initialize the counters")?;
            run(config, resolver)
        }
    }
}

/// Starts the engine and runs the interactive commands.
fn run(config: AgentConfig, resolver: Arc<dyn Resolver>) -> anyhow::Result<()> {
    let observers = build_observers(&config.destinations).context("invalid destination")?;
    let engine = EngineBuilder::new(config.engine)
        .counters(config.counters)
        .observers(observers)
        .build(resolver)
        .context("startup failure")?;

    engine.start();
    log::info!("Palantiri agent started, type 'help' to list the commands.");

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    run_commands(&engine, stdin.lock(), &mut stdout).context("error while running")?;

    engine.stop();
    engine.wait_stopped(STOP_TIMEOUT).context("error while stopping")?;
    log::info!("Palantiri agent stopped.");
    Ok(())
}

#[cfg(target_os = "linux")]
fn create_resolver() -> anyhow::Result<Arc<dyn Resolver>> {
    let resolver = palantiri_procfs::ProcfsResolver::new(palantiri_procfs::Config::default())?;
    Ok(Arc::new(resolver))
}

#[cfg(not(target_os = "linux"))]
fn create_resolver() -> anyhow::Result<Arc<dyn Resolver>> {
    anyhow::bail!("no counter resolver is available on this platform")
}

/// Applies the settings given on the command line, which take precedence over the config file.
fn apply_overrides(args: &cli::CommonArgs, config: &mut AgentConfig) {
    if let Some(period) = args.sample_period {
        config.engine.sample_period = period;
    }
    if let Some(period) = args.recreation_period {
        config.engine.recreation_period = period;
    }
    if let Some(output) = &args.output_file {
        let csv = palantiri_csv::Config {
            path: output.into(),
            ..Default::default()
        };
        config.destinations.push(palantiri_agent::config::Destination::Csv(csv));
    }
    log::debug!(
        "Effective config: {}",
        config.to_string(Format::Json).unwrap_or_else(|e| e.to_string())
    );
}

/// Prints a short welcome message.
fn print_welcome() {
    // It is useful to have the precise version of the agent in the logs.
    log::info!("Starting Palantiri agent '{BINARY}' v{}", agent_version());
}

/// Generates a version number from the information generated in the build script.
/// See `build.rs` at the crate root.
fn agent_version() -> String {
    const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");
    if option_env!("PALANTIRI_AGENT_RELEASE").is_some() {
        const BUILD_DATE: &str = env!("VERGEN_BUILD_DATE");
        format!("{CRATE_VERSION} ({BUILD_DATE})")
    } else {
        const BUILD_TIMESTAMP: &str = env!("VERGEN_BUILD_TIMESTAMP");
        const RUSTC_SEMVER: &str = env!("VERGEN_RUSTC_SEMVER");
        const CARGO_DEBUG: &str = env!("VERGEN_CARGO_DEBUG");
        format!("{CRATE_VERSION} ({BUILD_TIMESTAMP}, rustc {RUSTC_SEMVER}, debug={CARGO_DEBUG})")
    }
}

/// Agent command-line interface (CLI).
///
/// To apply "advanced" tweaks, we combine the "derive" and "builder" APIs of clap.
/// See https://docs.rs/clap/latest/clap/_derive/index.html#mixing-builder-and-derive-apis
mod cli {
    use clap::{Args, Parser, Subcommand};
    use std::time::Duration;

    // NOTE: the doc comment attached to `Cli` is used by clap as the description of
    // the application. It is displayed at the start of the help message.

    /// Palantiri agent: sample system counters at a fixed period.
    #[derive(Parser)]
    pub struct Cli {
        #[command(subcommand)]
        pub command: Option<Command>,

        #[command(flatten)]
        pub common: CommonArgs,
    }

    #[derive(Subcommand)]
    pub enum Command {
        /// Run the agent and sample the counters.
        ///
        /// This is the default command. The agent reads commands from the standard input.
        Run,

        /// Manipulate the configuration.
        Config(ConfigArgs),

        /// Get information about the counters.
        Counters(CountersArgs),
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

    #[derive(Args)]
    pub struct CountersArgs {
        #[command(subcommand)]
        pub command: CountersCommand,
    }

    #[derive(Subcommand)]
    pub enum CountersCommand {
        /// Print the counters that can be resolved on this machine.
        List,
    }

    /// Common CLI arguments.
    #[derive(Args, Clone)]
    pub struct CommonArgs {
        /// Path to the config file, in JSON (or TOML if the extension is `.toml`).
        #[arg(long, env = "PALANTIRI_CONFIG", default_value = palantiri_agent::config::DEFAULT_CONFIG_FILE)]
        pub config: String,

        /// If set, the config file must exist, otherwise the agent will fail to start with an error.
        #[arg(long, default_value_t = false)]
        pub no_default_config: bool,

        /// Time between two samples, ex. `500ms`.
        #[arg(long, value_parser = humantime::parse_duration)]
        pub sample_period: Option<Duration>,

        /// Time between two recreations of the counters' resources, ex. `1min`.
        #[arg(long, value_parser = humantime::parse_duration)]
        pub recreation_period: Option<Duration>,

        /// Path to an additional CSV output file.
        #[arg(long)]
        pub output_file: Option<String>,
    }
}
