use super::launcher;
use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;

pub async fn run(file: PathBuf) -> Result<()> {
    let launcher = launcher()?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
    );
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner.set_message(format!("Importing {}...", file.display()));

    let result = launcher.import(&file).await;
    spinner.finish_and_clear();

    match result {
        Ok(version) => {
            println!("✓ Imported {}", version.name);
            println!("  Location: {}", version.install_dir.display());
            println!();
            println!(
                "💡 Start it with: mclauncher launch {} --channel imported --format {}",
                version.name, version.format
            );
            Ok(())
        }
        Err(_) => anyhow::bail!("Import of {} failed", file.display()),
    }
}
