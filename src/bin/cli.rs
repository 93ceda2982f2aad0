use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Generator, Shell};
use lora_merge::cli::{self, commands::*, CliResult};
use std::io;

#[derive(Parser)]
#[command(
    name = "lora-merge",
    version,
    about = "Merge a LoRA adapter into one submodule of a multimodal checkpoint",
    long_about = "lora-merge loads a base checkpoint, extracts a named submodule (e.g. 'thinker'), \
                  folds a PEFT LoRA adapter into its weights and saves the merged checkpoint \
                  together with tokenizer, processor and auxiliary files."
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set the verbosity level (can be repeated for more verbose output)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Silence all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Use JSON output format
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file path
    #[arg(short, long, global = true, env = "LORA_MERGE_CONFIG")]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge a LoRA adapter into a submodule and save the result
    Merge(MergeCommand),
    /// Show submodules of a checkpoint and check an adapter against one
    Inspect(InspectCommand),
    /// Manage lora-merge configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum ConfigSubcommand {
    /// Show current configuration
    Show,
    /// Initialize configuration file
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

fn print_completions<G: Generator>(gen: G, cmd: &mut clap::Command) {
    generate(gen, cmd, cmd.get_name().to_string(), &mut io::stdout());
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        e.print_error();
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    // `config init` must work before any file exists
    let config = match &cli.command {
        Commands::Config {
            subcommand: ConfigSubcommand::Init { .. },
        }
        | Commands::Completions { .. } => cli::config::Config::default(),
        _ => cli::config::load_config(cli.config.as_deref())?,
    };

    let json = cli.json || config.logging.json_format;
    cli::logging::init_logging(cli.verbose, cli.quiet, json, &config.logging.level)?;

    match cli.command {
        Commands::Merge(cmd) => cli::commands::merge::execute(cmd, config, json, cli.quiet).await,
        Commands::Inspect(cmd) => cli::commands::inspect::execute(cmd, config, json).await,
        Commands::Config { subcommand } => handle_config(subcommand, &config, cli.config.as_deref(), json),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            print_completions(shell, &mut cmd);
            Ok(())
        }
    }
}

fn handle_config(
    subcommand: ConfigSubcommand,
    config: &cli::config::Config,
    config_path: Option<&str>,
    json: bool,
) -> CliResult<()> {
    match subcommand {
        ConfigSubcommand::Show => cli::config::show_config(config, json),
        ConfigSubcommand::Init { force } => {
            let path = cli::config::init_config(config_path, force)?;
            cli::logging::success(&format!("Configuration file created: {}", path.display()));
            Ok(())
        }
    }
}
