use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::VersionArgs;

/// Environment variable holding the log filter (e.g. `mclauncher=debug`)
const LOG_ENV: &str = "MCLAUNCHER_LOG";

/// MCLauncher - install and launch Minecraft for Windows versions side by side
#[derive(Parser)]
#[command(name = "mclauncher")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download and install a version
    Download {
        #[command(flatten)]
        version: VersionArgs,

        /// Update identity to resolve through the update service
        #[arg(short, long)]
        identifier: Option<String>,

        /// Direct download link, tried before the update service (repeatable)
        #[arg(short, long = "url")]
        urls: Vec<String>,
    },

    /// Register (if needed) and start an installed version
    Launch {
        #[command(flatten)]
        version: VersionArgs,
    },

    /// Unregister and delete an installed version
    Remove {
        #[command(flatten)]
        version: VersionArgs,
    },

    /// Install a package file from disk (.appx or .msixvc)
    Import {
        /// Path to the package file
        file: PathBuf,
    },

    /// List installed and imported versions
    List,

    /// Authorize with your account for beta and preview downloads
    SignIn,

    /// Uninstall every version so the game can be reinstalled from the store
    CleanupAll {
        /// Don't ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., download.delete_package_after_install)
        key: String,
        /// Configuration value
        value: String,
    },

    /// Print the configuration file path
    Path,
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    let result = match cli.command {
        Commands::Download {
            version,
            identifier,
            urls,
        } => commands::download::run(version, identifier, urls).await,
        Commands::Launch { version } => commands::launch::run(version).await,
        Commands::Remove { version } => commands::remove::run(version).await,
        Commands::Import { file } => commands::import::run(file).await,
        Commands::List => commands::list::run(),
        Commands::SignIn => commands::sign_in::run().await,
        Commands::CleanupAll { yes } => commands::cleanup::run(yes).await,
        Commands::Config { action } => commands::config::run(&action),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "mclauncher", &mut std::io::stdout());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
