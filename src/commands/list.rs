use super::launcher;
use anyhow::Result;
use mclauncher::Channel;

pub fn run() -> Result<()> {
    let launcher = launcher()?;
    let versions = launcher.installed_versions()?;

    if versions.is_empty() {
        println!("No versions installed.");
        println!();
        println!("Download one with: mclauncher download <name> --identifier <update-id>");
        return Ok(());
    }

    let (imported, managed): (Vec<_>, Vec<_>) =
        versions.iter().partition(|v| v.channel == Channel::Imported);

    if !managed.is_empty() {
        println!("Installed:");
        for version in &managed {
            println!("  {} [{}]", version.display_name(), version.format);
        }
        println!();
    }

    if !imported.is_empty() {
        println!("Imported:");
        for version in &imported {
            println!("  {} [{}]", version.name, version.format);
        }
        println!();
    }

    println!(
        "Total: {} version{}",
        versions.len(),
        if versions.len() == 1 { "" } else { "s" }
    );

    Ok(())
}
