use super::{launcher, with_progress, VersionArgs};
use anyhow::Result;

pub async fn run(version: VersionArgs) -> Result<()> {
    let launcher = launcher()?;
    let descriptor = version.descriptor(&launcher, None);

    println!("🚀 Launching {}...", descriptor.display_name());

    match with_progress(&descriptor, launcher.launch(&descriptor)).await {
        Ok(()) => {
            println!("✓ Launched {}", descriptor.display_name());
            Ok(())
        }
        Err(_) => anyhow::bail!("Launch of {} failed", descriptor.display_name()),
    }
}
