use super::{launcher, with_progress, VersionArgs};
use anyhow::Result;

pub async fn run(version: VersionArgs) -> Result<()> {
    let launcher = launcher()?;
    let descriptor = version.descriptor(&launcher, None);

    if !descriptor.is_installed() {
        println!("{} is not installed.", descriptor.display_name());
        return Ok(());
    }

    println!("🗑️  Removing {}...", descriptor.display_name());

    match with_progress(&descriptor, launcher.remove(&descriptor)).await {
        Ok(()) => {
            println!("✓ Removed {}", descriptor.display_name());
            Ok(())
        }
        Err(_) => anyhow::bail!("Removal of {} failed", descriptor.display_name()),
    }
}
