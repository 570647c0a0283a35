use super::{cancel_on_ctrl_c, launcher, with_progress, VersionArgs};
use anyhow::Result;
use tokio_util::sync::CancellationToken;

pub async fn run(
    version: VersionArgs,
    identifier: Option<String>,
    urls: Vec<String>,
) -> Result<()> {
    if identifier.is_none() && urls.is_empty() {
        anyhow::bail!("Specify an update identity with --identifier or a direct link with --url");
    }

    let launcher = launcher()?;
    let descriptor = version
        .descriptor(&launcher, identifier.as_deref())
        .with_source_urls(urls);

    println!("📦 Downloading {}...", descriptor.display_name());
    println!();

    let cancel = CancellationToken::new();
    let ctrl_c = cancel_on_ctrl_c(cancel.clone());
    let result = with_progress(&descriptor, launcher.download(&descriptor, cancel)).await;
    ctrl_c.abort();

    match result {
        Ok(()) => {
            println!("✓ Installed {}", descriptor.display_name());
            println!("  Location: {}", descriptor.install_dir.display());
            println!();
            println!("💡 Start it with: mclauncher launch {}", version.name);
            Ok(())
        }
        Err(e) if e.is_cancelled() => {
            println!("Download cancelled.");
            Ok(())
        }
        Err(_) => anyhow::bail!("Download of {} failed", descriptor.display_name()),
    }
}
