//! `taskforge serve`: reconciler plus HTTP gateway.

use std::convert::Infallible;
use std::sync::Arc;
use tracing::{info, warn};

use taskforge_config::AppConfig;
use taskforge_core::{EventBus, EventHub, ProviderResolver};
use taskforge_gateway::{GatewayState, build_router};
use taskforge_interpreter::Interpreter;
use taskforge_providers::ProviderFactory;
use taskforge_reconciler::{Reconciler, Runtime};
use taskforge_security::SecretsManager;

pub async fn run(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    if let Some(port) = port {
        config.gateway.port = port;
    }

    let passphrase = config.secrets.passphrase.clone().ok_or(
        "No secrets passphrase configured. Run `taskforge onboard` or set TASKFORGE_SECRET_KEY",
    )?;
    if !config.database.is_in_memory() {
        std::fs::create_dir_all(AppConfig::config_dir())?;
    }

    // === Build shared subsystems once ===
    let store = taskforge_store::open(&config.database.url).await?;
    let secrets = Arc::new(SecretsManager::new(&passphrase));
    let hub = Arc::new(EventHub::new(
        store.clone(),
        config.reconciler.subscriber_capacity,
    ));
    let bus = Arc::new(EventBus::default());

    let tools = taskforge_tools::default_registry(&config.tools);
    let interpreter = Arc::new(
        Interpreter::new(tools, config.interpreter.clone()).with_default_interceptors(hub.clone()),
    );
    let resolver: Arc<dyn ProviderResolver> = Arc::new(ProviderFactory::new(secrets.clone()));
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        resolver,
        interpreter.clone(),
        hub.clone(),
        config.reconciler.clone(),
    ));
    let runtime = Runtime::new(reconciler, bus.clone());

    println!("taskforge · serving");
    println!("   Store: {}", store.name());
    println!("   Workers: {}", config.reconciler.concurrency);
    println!("   Tools: {}", interpreter.tools().names().join(", "));

    if config.gateway.enabled {
        println!(
            "   Gateway: http://{}:{}",
            config.gateway.host, config.gateway.port
        );
        let router = build_router(Arc::new(GatewayState {
            store,
            secrets,
            bus,
            hub,
        }));
        runtime
            .run(
                taskforge_gateway::serve(&config.gateway, router),
                shutdown_signal(),
            )
            .await?;
    } else {
        println!("   Gateway: disabled");
        runtime
            .run(
                std::future::pending::<Result<(), Infallible>>(),
                shutdown_signal(),
            )
            .await?;
    }

    info!("taskforge stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C, running until killed");
        std::future::pending::<()>().await;
    }
}
