//! `taskforge onboard`: first-time setup.

use rand::Rng;
use std::path::Path;
use taskforge_config::AppConfig;

pub async fn run(force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_dir = AppConfig::config_dir();
    let config_path = config_dir.join("config.toml");

    println!("taskforge · first-time setup");
    println!("============================\n");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
        println!("✅ Created config directory: {}", config_dir.display());
    } else {
        println!("  Config directory exists: {}", config_dir.display());
    }

    if write_config(&config_path, force)? {
        println!("✅ Created config.toml at: {}", config_path.display());
        println!("\n📝 Next steps:");
        println!("   1. Run: taskforge serve");
        println!("   2. POST a provider, model and agent to /v1, then create a task\n");
    } else {
        println!("\n⚠️  Config already exists at: {}", config_path.display());
        println!("   Edit it manually or re-run with --force.\n");
    }

    Ok(())
}

/// Write the default config with a generated passphrase.
///
/// Returns `false` when a config already exists and `force` is not set.
pub fn write_config(path: &Path, force: bool) -> Result<bool, Box<dyn std::error::Error>> {
    if path.exists() && !force {
        return Ok(false);
    }

    let mut config = AppConfig::default();
    config.secrets.passphrase = Some(generate_passphrase());
    let rendered = toml::to_string_pretty(&config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, rendered)?;
    Ok(true)
}

fn generate_passphrase() -> String {
    let mut key = [0u8; 32];
    rand::rng().fill(&mut key);
    key.iter().map(|b| format!("{b:02x}")).collect()
}
