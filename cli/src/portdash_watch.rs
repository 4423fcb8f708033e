//! # Dashboard Watch
//!
//! Terminal stand-in for the dashboard views. Loads each watched resource over
//! REST, then subscribes to the push socket and prints every live update. When
//! an update arrives for a listable resource, the collection is refetched so
//! the printed totals stay current.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use serde_json::Value;
use tokio::signal;
use tokio::sync::mpsc;

use lib_portdash::configs::config_sync::{load_config, SyncConfig};
use lib_portdash::loggers::setup::setup_logging;
use lib_portdash::provider::{DataProvider, ListParams, Resource, Verb};
use lib_portdash::sync::{ConnectionManager, MessageRouter, Subscription};

#[derive(Parser, Debug)]
#[clap(about = "Print live dashboard updates", version)]
struct Args {
    #[clap(flatten)]
    config: SyncConfig,

    #[clap(
        long,
        value_delimiter = ',',
        default_value = "accounts,containers,system_status",
        help = "Resources to watch."
    )]
    watch: Vec<String>,

    #[clap(long, help = "Do not refetch a resource over REST when it changes.")]
    no_refetch: bool,
}

async fn print_list(provider: &DataProvider, resource: Resource) {
    match provider.list(resource, &ListParams::default()).await {
        Ok(set) => {
            let ids: Vec<String> = set.records.iter().map(|r| r.id_string()).collect();
            let _ = writeln!(std::io::stdout(), "[{}] {} record(s): {}", resource, set.total, ids.join(", "));
        }
        Err(e) => log::error!("Failed to load {}: {}", resource, e),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let settings = load_config(args.config)?.resolve()?;
    let log_path = setup_logging("portdash_watch", &settings.log_dir, &settings.log_level)?;
    log::info!("Logging to {}", log_path.display());

    let resources = args
        .watch
        .iter()
        .map(|name| name.parse::<Resource>())
        .collect::<Result<Vec<_>, _>>()?;

    let provider = Arc::new(DataProvider::from_settings(&settings)?);
    let listable: Vec<Resource> = resources
        .iter()
        .copied()
        .filter(|r| provider.endpoints().supports(*r, Verb::List))
        .collect();

    for resource in &listable {
        print_list(&provider, *resource).await;
    }

    // Listeners run on the socket task and must not block; refetches go through a channel.
    let (refetch_tx, mut refetch_rx) = mpsc::unbounded_channel::<Resource>();
    let router = Arc::new(MessageRouter::new());
    let mut subscriptions: Vec<Subscription> = Vec::new();
    for resource in resources {
        let refetch = (!args.no_refetch && listable.contains(&resource)).then(|| refetch_tx.clone());
        subscriptions.push(router.subscribe_fn(resource.as_str(), move |data: &Value| {
            // A closed stdout (e.g. piped into `head`) must not panic the socket task.
            let _ = writeln!(std::io::stdout(), "[{}] update: {}", resource, data);
            if let Some(tx) = &refetch {
                let _ = tx.send(resource);
            }
        }));
    }
    drop(refetch_tx);

    let refetcher = {
        let provider = provider.clone();
        tokio::spawn(async move {
            while let Some(resource) = refetch_rx.recv().await {
                print_list(&provider, resource).await;
            }
        })
    };

    let manager = ConnectionManager::from_settings(&settings, router);
    manager.connect();

    let mut states = manager.watch_state();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Interrupted, closing connection");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() || manager.is_exhausted() {
                    log::error!("Giving up on {}", manager.websocket_url());
                    break;
                }
            }
        }
    }

    manager.shutdown().await;
    drop(subscriptions);
    refetcher.abort();
    Ok(())
}
