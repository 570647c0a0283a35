use super::launcher;
use anyhow::Result;

pub async fn run() -> Result<()> {
    let launcher = launcher()?;

    println!("🔐 Requesting a user ticket...");
    match launcher.sign_in().await {
        Ok(()) => {
            println!("✓ Signed in");
            println!("  Beta and preview versions can now be downloaded in this session.");
            Ok(())
        }
        Err(_) => anyhow::bail!("Sign-in failed"),
    }
}
