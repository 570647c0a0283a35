pub mod cleanup;
pub mod config;
pub mod download;
pub mod import;
pub mod launch;
pub mod list;
pub mod remove;
pub mod sign_in;

use anyhow::Result;
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use mclauncher::version::sanitize_file_name;
use mclauncher::{
    Channel, Config, InstallState, Launcher, Operator, PackageFormat, VersionDescriptor,
};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Which installed version a command acts on
#[derive(Args, Debug, Clone)]
pub struct VersionArgs {
    /// Version name (e.g., 1.20.0.1)
    pub name: String,

    /// Release channel: release, beta, preview or imported
    #[arg(short, long, default_value = "release")]
    pub channel: Channel,

    /// Package format: archive or container
    #[arg(short, long, default_value = "archive")]
    pub format: PackageFormat,
}

impl VersionArgs {
    pub fn descriptor(&self, launcher: &Launcher, identifier: Option<&str>) -> VersionDescriptor {
        if self.channel == Channel::Imported {
            let dir = launcher
                .config()
                .paths
                .imported_dir
                .join(sanitize_file_name(&self.name));
            return VersionDescriptor::imported(self.name.clone(), self.format, dir);
        }
        launcher.catalog_version(
            identifier.unwrap_or(mclauncher::version::UNKNOWN_IDENTIFIER),
            self.name.clone(),
            self.channel,
            self.format,
        )
    }
}

/// Operator that talks to the terminal
pub struct ConsoleOperator;

impl Operator for ConsoleOperator {
    fn notify(&self, title: &str, message: &str) {
        eprintln!();
        eprintln!("❌ {}", title);
        for line in message.lines() {
            eprintln!("   {}", line);
        }
        eprintln!();
    }

    fn confirm(&self, title: &str, question: &str) -> bool {
        println!();
        println!("⚠️  {}", title);
        println!("   {}", question);
        print!("Continue? (yes/no): ");
        if std::io::stdout().flush().is_err() {
            return false;
        }

        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
    }
}

pub fn launcher() -> Result<Launcher> {
    let config = Config::load()?;
    Ok(Launcher::from_config(config, Arc::new(ConsoleOperator))?)
}

/// Cancel `token` when the user presses Ctrl-C
pub fn cancel_on_ctrl_c(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling...");
            token.cancel();
        }
    })
}

/// Mirror a version's install state onto a progress bar until aborted
pub fn track_progress(
    mut state: watch::Receiver<Option<InstallState>>,
) -> (ProgressBar, JoinHandle<()>) {
    let pb = ProgressBar::new_spinner();
    pb.set_style(spinner_style());
    pb.enable_steady_tick(Duration::from_millis(80));

    let bar = pb.clone();
    let handle = tokio::spawn(async move {
        let mut determinate = false;
        while state.changed().await.is_ok() {
            let Some(current) = state.borrow_and_update().clone() else {
                continue;
            };
            if current.is_indeterminate() || current.total == 0 {
                if determinate {
                    bar.set_style(spinner_style());
                    determinate = false;
                }
                bar.set_message(current.display_status());
            } else {
                if !determinate {
                    bar.set_style(bytes_style());
                    determinate = true;
                }
                bar.set_length(current.total);
                bar.set_position(current.transferred);
                bar.set_message(current.phase.to_string());
            }
        }
    });
    (pb, handle)
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.green} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
}

fn bytes_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// Run an operation on `version` with a progress display attached
pub async fn with_progress<F, T>(version: &VersionDescriptor, operation: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let (pb, handle) = track_progress(version.subscribe());
    let result = operation.await;
    handle.abort();
    pb.finish_and_clear();
    result
}
