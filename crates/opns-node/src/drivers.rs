//! The long-running loops behind `opnsd`'s subcommands.
//!
//! Failure policy: anything that breaks a single transaction's processing
//! is fatal. The driver logs and panics; the supervising process restarts
//! it and the durable queue picks up exactly where it stopped, because the
//! applied-transaction flag is the last write of a submission.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use futures::stream;
use futures::StreamExt;
use log::error;
use log::info;
use log::warn;
use opns_common::block_score;
use opns_common::Outpoint;
use opns_storage::OverlayStore;
use serde::Deserialize;
use tokio::time::sleep;

use crate::error::NodeError;
use crate::OpnsNode;

/// How long the subscriber idles when the feed has nothing new.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Throughput summary cadence of the processor.
const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// One feed entry: a transaction and its position in the chain.
#[derive(Debug, Deserialize)]
struct FeedEvent {
    id: bitcoin::Txid,
    #[serde(default)]
    height: u32,
    #[serde(default)]
    idx: u64,
}

fn running(shutdown: &AtomicBool) -> bool {
    !shutdown.load(Ordering::Relaxed)
}

/// Polls the feed and persists `(txid, height·10⁹ + idx)` into the pending
/// queue, remembering the resume height across restarts.
pub async fn run_subscriber(node: &OpnsNode, shutdown: Arc<AtomicBool>) -> Result<(), NodeError> {
    let subscription = &node.config().subscription_id;
    let client = reqwest::Client::new();
    let mut from_height = node
        .queue()
        .progress(subscription)?
        .unwrap_or(node.config().start_height);
    info!("subscribing to {subscription} from height {from_height}");

    while running(&shutdown) {
        let url = format!(
            "{}/v1/feed/{subscription}?from={from_height}",
            node.config().feed_url.trim_end_matches('/')
        );
        let events: Vec<FeedEvent> = match client.get(&url).send().await {
            Ok(response) => response.error_for_status()?.json().await?,
            Err(e) => {
                warn!("feed poll failed, retrying: {e}");
                sleep(POLL_INTERVAL).await;
                continue;
            }
        };

        if events.is_empty() {
            sleep(POLL_INTERVAL).await;
            continue;
        }

        let count = events.len();
        for event in events {
            node.queue()
                .push(&event.id, block_score(event.height, event.idx))?;
            from_height = from_height.max(event.height);
        }
        node.queue().set_progress(subscription, from_height)?;
        info!("queued {count} transactions, resume height {from_height}");
    }
    Ok(())
}

/// Resolves every pending transaction and its ancestry into the local
/// cache, without admitting anything.
pub async fn run_downloader(node: &OpnsNode, shutdown: Arc<AtomicBool>) -> Result<(), NodeError> {
    let pending = node.queue().drain_ordered()?;
    info!("downloading ancestry for {} transactions", pending.len());

    let concurrency = node.config().fetch_concurrency.max(1);
    stream::iter(pending)
        .for_each_concurrent(concurrency, |(_, txid)| {
            let shutdown = shutdown.clone();
            async move {
                if !running(&shutdown) {
                    return;
                }
                let started = Instant::now();
                let tx = match node.fetcher().load_tx(&txid).await {
                    Ok(tx) => tx,
                    Err(e) => {
                        error!("failed to download {txid}: {e}");
                        panic!("failed to download {txid}: {e}");
                    }
                };
                for input in &tx.input {
                    let source = input.previous_output.txid;
                    if let Err(e) = node.fetcher().load_tx(&source).await {
                        error!("failed to download source {source}: {e}");
                        panic!("failed to download source {source}: {e}");
                    }
                }
                info!("downloaded {txid} in {:?}", started.elapsed());
            }
        })
        .await;
    Ok(())
}

/// Consumes the pending queue in score order through the admission engine.
pub async fn run_processor(node: &OpnsNode, shutdown: Arc<AtomicBool>) -> Result<(), NodeError> {
    let pending = node.queue().drain_ordered()?;
    info!("processing {} pending transactions", pending.len());

    let mut tx_count = 0usize;
    let mut output_count = 0usize;
    let mut last_report = Instant::now();

    for (_, txid) in pending {
        if !running(&shutdown) {
            info!("shutdown requested, stopping processor");
            break;
        }

        let started = Instant::now();
        let steak = match node.ingest_transaction(&txid).await {
            Ok(steak) => steak,
            Err(e) => {
                // Fatal by design: the supervisor restarts us and the queue
                // still holds this transaction.
                error!("failed to process {txid}: {e}");
                panic!("failed to process {txid}: {e}");
            }
        };
        node.queue().remove(&txid)?;

        let admitted = steak
            .get(&node.config().topic)
            .map(|admit| admit.outputs_to_admit.len())
            .unwrap_or(0);
        tx_count += 1;
        output_count += admitted;
        info!(
            "processed {txid} in {:?}, admitted {admitted} outputs",
            started.elapsed()
        );

        if last_report.elapsed() >= REPORT_INTERVAL {
            let elapsed = last_report.elapsed().as_secs_f64();
            info!(
                "processed {tx_count} tx / {output_count} outputs in {elapsed:.0}s ({:.1} tx/s)",
                tx_count as f64 / elapsed
            );
            tx_count = 0;
            output_count = 0;
            last_report = Instant::now();
        }
    }
    Ok(())
}

/// Walks forward from every claimed name through the external spends
/// index, admitting spending transactions as it finds them.
pub async fn run_spend_tracker(
    node: &OpnsNode,
    shutdown: Arc<AtomicBool>,
) -> Result<(), NodeError> {
    let events = node.lookup().events_with_prefix("opns:")?;
    info!("tracking spends for {} claimed names", events.len());

    for event in events {
        for (member, _) in node.lookup().members(&event)? {
            let mut frontier: Vec<String> = vec![member];
            while let Some(current) = frontier.pop() {
                if !running(&shutdown) {
                    return Ok(());
                }
                let outpoint: Outpoint = current.parse()?;

                // Skip what we already know is spent.
                let stored = node.engine().storage().find_output(
                    &outpoint,
                    Some(&node.config().topic),
                    None,
                    false,
                )?;
                match stored {
                    Some(output) if !output.spent => {}
                    _ => continue,
                }

                let Some(spend_txid) = node.fetcher().spend_of(&outpoint).await? else {
                    continue;
                };
                info!("{outpoint} spent by {spend_txid}");
                let steak = match node.ingest_transaction(&spend_txid).await {
                    Ok(steak) => steak,
                    Err(e) => {
                        error!("failed to ingest spend {spend_txid}: {e}");
                        panic!("failed to ingest spend {spend_txid}: {e}");
                    }
                };

                // Follow the claim wherever it went.
                if let Some(admit) = steak.get(&node.config().topic) {
                    for vout in &admit.outputs_to_admit {
                        let next = Outpoint::new(spend_txid, *vout);
                        let carried = node
                            .lookup()
                            .outpoint_events(&next)?
                            .iter()
                            .any(|event| event.starts_with("opns:"));
                        if carried {
                            frontier.push(next.to_string());
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
