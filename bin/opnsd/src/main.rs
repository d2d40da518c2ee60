// SPDX-License-Identifier: MIT

//! The OpNS overlay daemon.
//!
//! Four driver subcommands share one data directory: `subscribe` fills the
//! durable queue from the feed, `download` prefetches transaction
//! ancestry, `process` runs the queue through the admission engine, and
//! `spends` walks claimed names forward through the external spends index.
//! Processing errors are deliberately fatal; a supervisor restarts the
//! daemon and the durable queue resumes where it stopped.

mod cli;

use std::process::exit;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Parser;
use cli::Cli;
use cli::Commands;
use opns_node::drivers;
use opns_node::Config;
use opns_node::OpnsNode;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    let params = Cli::parse();

    let log_level = if params.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (subscription_id, start_height) = match &params.command {
        Commands::Subscribe {
            subscription_id,
            from_height,
        } => (subscription_id.clone(), *from_height),
        _ => (String::new(), 0),
    };

    let config = Config {
        data_dir: params.data_dir.clone(),
        topic: params.topic.clone(),
        feed_url: params.feed_url.clone(),
        subscription_id,
        start_height,
        fetch_concurrency: params.fetch_concurrency,
    };

    let node = OpnsNode::open(config).unwrap_or_else(|e| {
        eprintln!("Failed to open node at {}: {e}", params.data_dir);
        exit(1);
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("opnsd")
        .build()
        .expect("tokio runtime");

    let shutdown = Arc::new(AtomicBool::new(false));
    let signal = shutdown.clone();
    runtime.spawn(async move {
        tokio::signal::ctrl_c().await.expect("ctrl-c handler");
        info!("shutdown signal received");
        signal.store(true, Ordering::Relaxed);
    });

    let result = runtime.block_on(async {
        match params.command {
            Commands::Subscribe { .. } => drivers::run_subscriber(&node, shutdown).await,
            Commands::Download => drivers::run_downloader(&node, shutdown).await,
            Commands::Process => drivers::run_processor(&node, shutdown).await,
            Commands::Spends => drivers::run_spend_tracker(&node, shutdown).await,
        }
    });

    if let Err(e) = result {
        error!("driver failed: {e}");
        exit(1);
    }
    info!("done");
}
