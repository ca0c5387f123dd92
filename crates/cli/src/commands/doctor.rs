//! `taskforge doctor`: diagnose configuration and storage.

use taskforge_config::AppConfig;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    println!("🩺 taskforge doctor");
    println!("===================\n");

    let mut issues = 0;

    let config_path = AppConfig::config_dir().join("config.toml");
    if !config_path.exists() {
        println!("  ⚠️  No config file, using defaults. Run `taskforge onboard`");
        issues += 1;
    }

    let config = match AppConfig::load() {
        Ok(config) => {
            println!("  ✅ Config valid");
            config
        }
        Err(e) => {
            println!("  ❌ Config invalid: {e}");
            println!("\n  ⚠️  Fix the config before running further checks.");
            return Ok(());
        }
    };

    if config.secrets.passphrase.is_some() {
        println!("  ✅ Secrets passphrase configured");
    } else {
        println!("  ❌ No secrets passphrase. Set secrets.passphrase or TASKFORGE_SECRET_KEY");
        issues += 1;
    }

    match taskforge_store::open(&config.database.url).await {
        Ok(store) => match store.list_pending_tasks().await {
            Ok(pending) => println!(
                "  ✅ Database reachable ({}, {} task(s) pending)",
                store.name(),
                pending.len()
            ),
            Err(e) => {
                println!("  ❌ Database query failed: {e}");
                issues += 1;
            }
        },
        Err(e) => {
            println!("  ❌ Database unreachable at {}: {e}", config.database.url);
            issues += 1;
        }
    }

    let tools = taskforge_tools::default_registry(&config.tools);
    println!("  ✅ {} host tool(s) available", tools.len());

    println!();
    if issues == 0 {
        println!("  🎉 All checks passed!");
    } else {
        println!("  ⚠️  {issues} issue(s) found. See above for details.");
    }

    Ok(())
}
