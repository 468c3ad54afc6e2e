//! disk-tier: operate a persistent disk-tier cache from the command line.
//!
//! Each invocation opens the store, reloads its index, runs one command and
//! unbinds, writing the index back for the next run.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use disk_tier::cache::element::now_millis;
use disk_tier::config::{Cli, Command, Config};
use disk_tier::{DiskCache, Element};

fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "disk_tier=debug"
    } else {
        "disk_tier=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!("disk-tier v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(directory) = cli.directory {
        config.store.directory = directory;
    }
    // One-shot process: the sweep would never fire.
    config.store.expiry_interval_ms = 0;

    info!(
        directory = %config.store.directory.display(),
        name = %config.store.name,
        persistent = config.store.persistent,
        "Configuration loaded"
    );

    let cache: DiskCache<String, String> =
        DiskCache::open(config).context("failed to open disk store")?;

    match cli.command {
        Command::Put {
            key,
            value,
            ttl_secs,
        } => {
            let mut element = Element::new(key, value);
            if let Some(secs) = ttl_secs {
                element = element.with_ttl(Duration::from_secs(secs));
            }
            cache.put(element);
        }
        Command::Get { key } => match cache.get(&key) {
            Some(element) => {
                println!("{}", element.value);
                if let Some(at) = element.expires_at {
                    let left = at.saturating_sub(now_millis());
                    info!(key = %key, hits = element.hit_count, expires_in_ms = left, "Hit");
                }
            }
            None => {
                cache.close()?;
                anyhow::bail!("key not found: {key}");
            }
        },
        Command::Remove { key } => {
            if !cache.remove(&key) {
                cache.close()?;
                anyhow::bail!("key not found: {key}");
            }
        }
        Command::Keys => {
            let mut keys = cache.keys();
            keys.sort();
            for key in keys {
                println!("{key}");
            }
        }
        Command::Expire => {
            let expired = cache.expire();
            println!("expired {expired}");
        }
        Command::Stats => {
            cache.flush().wait()?;
            print!("{}", cache.store().render_metrics()?);
        }
    }

    cache.close()?;
    Ok(())
}
