use super::launcher;
use anyhow::Result;
use std::io::Write;

pub async fn run(yes: bool) -> Result<()> {
    let launcher = launcher()?;
    let versions = launcher.installed_versions()?;

    if versions.is_empty() {
        println!("No versions installed.");
        return Ok(());
    }

    println!("Versions installed by the launcher will be uninstalled:");
    for version in &versions {
        println!("  • {}", version.display_name());
    }
    println!();
    println!("This allows reinstalling the game from the store.");
    println!("Your data (worlds, etc.) won't be removed.");
    println!();

    if !yes {
        print!("Continue? (yes/no): ");
        std::io::stdout().flush()?;

        let mut confirmation = String::new();
        std::io::stdin().read_line(&mut confirmation)?;
        if confirmation.trim().to_lowercase() != "yes" {
            println!("Cleanup cancelled.");
            return Ok(());
        }
        println!();
    }

    let total = versions.len();
    match launcher.cleanup_all(&versions).await {
        Ok(removed) => {
            println!("✓ Removed {} version{}", removed, if removed == 1 { "" } else { "s" });
            Ok(())
        }
        Err(_) => anyhow::bail!("Some of the {} versions could not be removed", total),
    }
}
