// SPDX-FileCopyrightText: The rcoredump contributors
//
// SPDX-License-Identifier: GPL-3.0-only

//! Wires the analysis and cleanup queues to their single long-lived
//! workers, and owns the two background sweeps (startup recovery of
//! unanalyzed documents, periodic retention). Cancellation propagates from
//! one root [`CancellationToken`] into every worker's select loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::analyzer::Analyzer;
use crate::index::{Index, SortField, SortOrder};
use crate::log::ResultExt;
use crate::metrics::Metrics;
use crate::store::Store;
use crate::wire::chrono_compat::Timestamp;
use crate::wire::Uid;

const SWEEP_PAGE_SIZE: usize = 100;
const RETENTION_TICK: Duration = Duration::from_secs(60);

/// Owns the analysis/cleanup channels and the background workers consuming
/// them. Both channels are unbounded: a slow analyzer or cleanup worker
/// applies no backpressure to uploads or deletes, per the design.
pub struct Dispatcher {
    analysis_tx: mpsc::UnboundedSender<Uid>,
    cleanup_tx: mpsc::UnboundedSender<Uid>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Starts the analysis worker, the cleanup worker, the startup recovery
    /// sweep, and (if `retention` is set) the retention sweeper.
    pub fn start(
        store: Store,
        index: Arc<dyn Index>,
        analyzer: Arc<Analyzer>,
        retention: Option<Duration>,
        metrics: Arc<Metrics>,
    ) -> Dispatcher {
        let cancel = CancellationToken::new();
        let (analysis_tx, analysis_rx) = mpsc::unbounded_channel();
        let (cleanup_tx, cleanup_rx) = mpsc::unbounded_channel();

        let mut handles = Vec::new();
        handles.push(tokio::spawn(analysis_worker(analyzer, analysis_rx)));
        handles.push(tokio::spawn(cleanup_worker(
            store,
            index.clone(),
            cleanup_rx,
            metrics,
        )));
        handles.push(tokio::spawn(recovery_sweep(
            index.clone(),
            analysis_tx.clone(),
            cancel.clone(),
        )));
        if let Some(retention) = retention {
            handles.push(tokio::spawn(retention_sweeper(
                index,
                cleanup_tx.clone(),
                retention,
                cancel.clone(),
            )));
        }

        Dispatcher {
            analysis_tx,
            cleanup_tx,
            cancel,
            handles,
        }
    }

    pub fn enqueue_analysis(&self, uid: Uid) {
        // The receiver only disappears once every sender (including the
        // worker-internal clones held here) is dropped during shutdown; a
        // send error at that point just means we're already stopping.
        let _ = self.analysis_tx.send(uid);
    }

    pub fn enqueue_cleanup(&self, uid: Uid) {
        let _ = self.cleanup_tx.send(uid);
    }

    /// Stops the periodic sweeps, then waits for both workers to drain
    /// whatever is already queued before returning.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let Dispatcher {
            analysis_tx,
            cleanup_tx,
            handles,
            ..
        } = self;
        drop(analysis_tx);
        drop(cleanup_tx);
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn analysis_worker(analyzer: Arc<Analyzer>, mut rx: mpsc::UnboundedReceiver<Uid>) {
    while let Some(uid) = rx.recv().await {
        analyzer.analyze(uid).await;
    }
}

async fn cleanup_worker(
    store: Store,
    index: Arc<dyn Index>,
    mut rx: mpsc::UnboundedReceiver<Uid>,
    metrics: Arc<Metrics>,
) {
    while let Some(uid) = rx.recv().await {
        match crate::cleanup::cleanup_one(&store, index.as_ref(), uid)
            .await
            .with_context(|| format!("cleaning up {uid}"))
        {
            Ok(()) => metrics.cleanups_total.inc(),
            Err(e) => Err::<(), _>(e).or_warn(),
        }
    }
}

/// Enqueues every document matching `analyzed:F*` at startup, so analyses
/// that failed (or were never run) before a restart get retried.
async fn recovery_sweep(
    index: Arc<dyn Index>,
    analysis_tx: mpsc::UnboundedSender<Uid>,
    cancel: CancellationToken,
) {
    let sweep = async {
        let mut offset = 0;
        loop {
            let page = match index
                .search(
                    "analyzed:F*",
                    SortField::DumpedAt,
                    SortOrder::Asc,
                    SWEEP_PAGE_SIZE,
                    offset,
                )
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!("recovery sweep: {e:#}");
                    return;
                }
            };
            if page.results.is_empty() {
                break;
            }
            let got = page.results.len();
            for coredump in page.results {
                let _ = analysis_tx.send(coredump.uid);
            }
            offset += got;
            if offset >= page.total {
                break;
            }
        }
        tracing::info!(count = offset, "recovery sweep enqueued unanalyzed documents");
    };
    tokio::select! {
        _ = sweep => {}
        _ = cancel.cancelled() => tracing::info!("recovery sweep cancelled by shutdown"),
    }
}

/// Fires every minute; repeatedly searches for cores past `retention`, 100
/// at a time, until no matches remain. Cleanup enqueueing races with the
/// cleanup worker actually deleting documents, so each tick pages by
/// advancing `offset` over its own result set (stopping once `offset` reaches
/// `page.total`) rather than re-reading from 0: a fresh `offset=0` read would
/// see the same still-undeleted documents again before the cleanup worker
/// catches up, spinning without making progress. Each page is still its own
/// fresh search; only the starting offset carries over, never a stale result
/// set.
async fn retention_sweeper(
    index: Arc<dyn Index>,
    cleanup_tx: mpsc::UnboundedSender<Uid>,
    retention: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(RETENTION_TICK);
    loop {
        tokio::select! {
            _ = interval.tick() => sweep_expired_until_empty(&index, &cleanup_tx, retention).await,
            _ = cancel.cancelled() => break,
        }
    }
}

async fn sweep_expired_until_empty(
    index: &Arc<dyn Index>,
    cleanup_tx: &mpsc::UnboundedSender<Uid>,
    retention: Duration,
) {
    let cutoff = Timestamp::from_unix_seconds(Timestamp::now().unix_seconds() - retention.as_secs() as i64);
    let query = format!(r#"dumped_at:<"{}""#, cutoff.to_rfc3339());
    // Page by advancing `offset` over this sweep's own result set rather than
    // re-reading from 0 each time: cleanup runs asynchronously on its own
    // worker, so a stale core enqueued on this tick may still be unindexed
    // (and thus still match) by the time we'd search again. Advancing offset
    // guarantees termination after `total` documents regardless of how far
    // the cleanup worker has gotten.
    let mut offset = 0;
    loop {
        let page = match index
            .search(&query, SortField::DumpedAt, SortOrder::Asc, SWEEP_PAGE_SIZE, offset)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!("retention sweep: {e:#}");
                return;
            }
        };
        if page.results.is_empty() {
            return;
        }
        let got = page.results.len();
        for coredump in page.results {
            let _ = cleanup_tx.send(coredump.uid);
        }
        offset += got;
        if offset >= page.total {
            return;
        }
    }
}
