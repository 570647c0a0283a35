use anyhow::Result;
use mclauncher::{Config, UrlPolicy};

pub fn run(action: &crate::ConfigAction) -> Result<()> {
    use crate::ConfigAction;

    match action {
        ConfigAction::Show => show_config(),
        ConfigAction::Set { key, value } => set_config(key, value),
        ConfigAction::Path => {
            println!("{}", Config::default_path()?.display());
            Ok(())
        }
    }
}

const KEYS: &[&str] = &[
    "paths.versions_dir",
    "paths.imported_dir",
    "paths.downloads_dir",
    "paths.backup_dir",
    "paths.decrypt_staging_dir",
    "protocol.endpoint",
    "protocol.url_policy",
    "protocol.revision",
    "download.delete_package_after_install",
    "download.timeout_secs",
    "auth.token_helper",
    "auth.ticket",
    "container.bootstrapper",
    "container.helper_timeout_secs",
    "container.poll_interval_ms",
    "container.executable_name",
    "container.app_id",
    "data.container_data_root",
    "data.packages_root",
    "data.worlds_dir",
    "data.migration_marker",
];

fn show_config() -> Result<()> {
    let config = Config::load()?;
    let config_path = Config::default_path()?;

    println!();
    println!("MCLauncher Configuration");
    println!();
    println!("  📁 Config file: {}", config_path.display());
    println!();

    println!("┌─ Paths");
    println!("│  Versions:          {}", config.paths.versions_dir.display());
    println!("│  Imported versions: {}", config.paths.imported_dir.display());
    println!("│  Downloads:         {}", config.paths.downloads_dir.display());
    println!("│  Data backup:       {}", config.paths.backup_dir.display());
    println!("│  Decrypt staging:   {}", config.paths.decrypt_staging_dir.display());
    println!("└─");
    println!();

    let policy = match &config.protocol.url_policy {
        UrlPolicy::AnyHttp => "any http(s) link".to_string(),
        UrlPolicy::HostPrefix { prefix } => format!("links starting with {}", prefix),
    };
    println!("┌─ Update service");
    println!("│  Endpoint:   {}", config.protocol.endpoint);
    println!("│  Accepts:    {}", policy);
    println!("│  Revision:   {}", config.protocol.revision);
    println!("└─");
    println!();

    println!("┌─ Downloads");
    println!(
        "│  Delete package after install: {}",
        format_bool(config.download.delete_package_after_install)
    );
    println!("│  Inactivity timeout:           {}s", config.download.timeout_secs);
    println!("└─");
    println!();

    println!("┌─ Authentication");
    println!("│  Token helper: {}", config.auth.token_helper.display());
    println!(
        "│  Static ticket: {}",
        if config.auth.ticket.is_some() { "<set>" } else { "<not set>" }
    );
    println!("└─");
    println!();

    println!("┌─ Container installs");
    println!("│  Bootstrapper staging: {}", format_bool(config.container.bootstrapper));
    println!("│  Helper timeout:       {}s", config.container.helper_timeout_secs);
    println!("│  Poll interval:        {}ms", config.container.poll_interval_ms);
    println!("│  Executable:           {}", config.container.executable_name);
    println!("│  Application id:       {}", config.container.app_id);
    println!("└─");
    println!();

    println!("┌─ Saved data");
    println!("│  Container data root: {}", config.data.container_data_root.display());
    println!("│  Packages root:       {}", config.data.packages_root.display());
    println!("│  Worlds directory:    {}", config.data.worlds_dir);
    println!("│  Migration marker:    {}", config.data.migration_marker.display());
    println!("└─");
    println!();

    println!("💡 Modify settings:");
    println!("   mclauncher config set <key> <value>");
    println!();

    Ok(())
}

fn format_bool(value: bool) -> &'static str {
    if value {
        "✅ enabled"
    } else {
        "❌ disabled"
    }
}

fn set_config(key: &str, value: &str) -> Result<()> {
    let mut config = Config::load()?;

    if let Err(e) = config.set_value(key, value) {
        println!("  ❌ {}", e);
        println!();
        println!("  Available keys:");
        for key in KEYS {
            println!("    • {}", key);
        }
        println!();
        anyhow::bail!("Configuration not changed");
    }

    config.save()?;
    if key == "auth.ticket" {
        println!("  ✓ auth.ticket = {}", if value.is_empty() { "<cleared>" } else { "<set>" });
    } else {
        println!("  ✓ {} = \"{}\"", key, value);
    }
    println!();
    println!("✅ Configuration saved");

    Ok(())
}
