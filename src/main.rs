//! mergefs daemon entry point

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use mergefs::config::Config;
use mergefs::fuse::FuseHook;
use mergefs::last_error::get_last_error;
use mergefs::mount::MountManager;
use mergefs::plugin::PluginRegistry;

/// Print usage information
fn print_usage() {
    eprintln!("Usage: mergefs <config.yaml>");
    eprintln!();
    eprintln!("mergefs - union filesystem over stacked read-only sources with a writable overlay");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  config.yaml    Path to configuration file");
    eprintln!();
    eprintln!("Example:");
    eprintln!("  mergefs /etc/mergefs/config.yaml");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        print_usage();
        std::process::exit(1);
    }

    let config_path = PathBuf::from(&args[1]);

    let config = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("mergefs starting");
    info!("Loaded configuration from {:?}", config_path);

    let registry = Arc::new(PluginRegistry::with_builtins());
    for plugin in &config.plugins {
        match registry.load_with_position(&plugin.path, plugin.front) {
            Ok(id) => debug!("Loaded plugin {} as {}", plugin.path, id),
            Err(e) => {
                error!("Failed to load plugin {}: {}", plugin.path, e);
                std::process::exit(1);
            }
        }
    }

    let manager = Arc::new(MountManager::new(
        registry,
        Arc::new(FuseHook::default()),
    ));

    // Set up signal handling for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    })?;

    for mount_config in &config.mounts {
        info!("Setting up mount at {:?}", mount_config.path);

        if !mount_config.path.exists() {
            debug!("Creating mount point directory {:?}", mount_config.path);
            if let Err(e) = std::fs::create_dir_all(&mount_config.path) {
                error!(
                    "Failed to create mount point {:?}: {}",
                    mount_config.path, e
                );
                continue;
            }
        }

        if let Err(e) = manager
            .mount(&mount_config.sources, mount_config.options.clone())
            .await
        {
            let (code, is_os_error) = get_last_error();
            error!(
                "Failed to mount {:?}: {} (code {:#x}{})",
                mount_config.path,
                e,
                code,
                if is_os_error { ", os error" } else { "" }
            );
            continue;
        }
    }

    if manager.list_mounts().is_empty() {
        error!("No filesystems were mounted successfully");
        std::process::exit(1);
    }

    info!("{} filesystem(s) mounted successfully", manager.list_mounts().len());
    info!("Press Ctrl+C to unmount and exit");

    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
    }

    info!("Shutting down");
    if let Err(e) = manager.unmount_all().await {
        warn!("Some filesystems did not unmount cleanly: {}", e);
    }
    info!("All filesystems unmounted, exiting");

    Ok(())
}
