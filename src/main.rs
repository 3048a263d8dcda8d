//! Source Runtime - command line front end
//!
//! Browses the plugin catalog and installs plugins into an in-memory
//! registry for the lifetime of the process.

use source_runtime::core::{self, CliArgs, Command};
use source_runtime::plugin::{self, ListOptions, PluginManager};

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration (CLI args, env vars and config file)
    let config = match core::Config::load(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            // Print error to stderr since logging isn't initialized yet
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let _logger = match core::Logger::init(&config.logging) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return Err(e);
        }
    };

    info!("Starting Source Runtime v{}", source_runtime::VERSION);
    info!(mirrors = ?config.catalog.mirrors, "Catalog configuration");
    info!(scratch_dir = ?config.loader.scratch_dir, "Loader configuration");

    std::fs::create_dir_all(&config.loader.scratch_dir).map_err(|e| {
        anyhow::anyhow!("Failed to create scratch directory {:?}: {}", config.loader.scratch_dir, e)
    })?;

    let manager = PluginManager::from_config(&config)?;
    manager.init().await?;

    let outcome = run(&manager, args.command).await;
    manager.shutdown().await;
    outcome
}

async fn run(manager: &PluginManager, command: Command) -> Result<()> {
    match command {
        Command::Browse => {
            for descriptor in manager.browse_catalog().await? {
                print_descriptor(&descriptor);
            }
        }
        Command::Search { query } => {
            let found = manager.search_catalog(&query).await?;
            if found.is_empty() {
                println!("No plugins match '{}'", query);
            }
            for descriptor in found {
                print_descriptor(&descriptor);
            }
        }
        Command::Install { id, query } => {
            let sink: plugin::ProgressSink = Arc::new(|percent, label: &str| {
                eprintln!("[{:>3}%] {}", percent, label);
            });
            let instance = manager.install(&id, Some(sink)).await?;
            let capabilities: Vec<_> = instance
                .effective_capabilities()
                .iter()
                .map(|c| c.as_str())
                .collect();
            println!(
                "Installed {} v{} ({})",
                instance.id,
                instance.version,
                capabilities.join(", ")
            );

            if let Some(query) = query {
                let items = instance.source().search(&query, &ListOptions::default()).await?;
                for item in items {
                    println!("  {}  {}", item.id, item.title);
                }
            }
        }
        Command::Updates { ids } => {
            for id in &ids {
                manager.install(id, None).await?;
            }
            let updates = manager.check_for_updates().await?;
            if updates.is_empty() {
                println!("All installed plugins are up to date");
            }
            for update in updates {
                println!("{}: {} -> {}", update.id, update.current_version, update.available_version);
            }
        }
    }
    Ok(())
}

fn print_descriptor(descriptor: &plugin::PluginDescriptor) {
    println!(
        "{:<24} {:<10} {}  [{}]",
        descriptor.id,
        descriptor.version,
        descriptor.display_name,
        descriptor.base_endpoint
    );
}
