//! Broker startup: recovery-terms readback, orphan cleanup, and the
//! cross-queue walk that seeds the message store's reference counts.
//!
//! The walk fans the durable queues out over a bounded pool of worker
//! threads; each worker replays a queue's on-disk index read-only and
//! pushes `(msg_id, 1)` through a bounded channel (the gatherer) that
//! the consumer drains one pair at a time. Backpressure is the channel
//! bound; no cross-worker ordering is preserved.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

use log::{error, info};

use crate::codec::MsgId;
use crate::index::scan_queue_segments;
use crate::layout::{all_queue_directory_names, queue_dir_name, queues_dir};
use crate::recovery_terms::{RecoveryTerms, RecoveryTermsStore};
use crate::Result;

/// Gatherer capacity; workers block once the consumer falls this far
/// behind.
const GATHERER_CAPACITY: usize = 1024;

/// Prepare the durable queues for recovery.
///
/// Reads each queue's recovery terms (missing terms mean the previous
/// shutdown was not clean), deletes every queue directory that belongs
/// to no durable queue, and clears the terms store so that a crash
/// before the next clean shutdown is detected as dirty. The terms come
/// back in the same order as `durable_queue_names`, alongside a
/// [`Walker`] the message store consumes to rebuild reference counts.
pub fn start(
    data_dir: &Path,
    durable_queue_names: &[String],
    terms_store: &RecoveryTermsStore,
) -> Result<(Vec<RecoveryTerms>, Walker)> {
    let mut ordered_terms = Vec::with_capacity(durable_queue_names.len());
    let mut durable_dirs = HashSet::new();
    for name in durable_queue_names {
        let dir_name = queue_dir_name(name);
        ordered_terms.push(match terms_store.read(&dir_name)? {
            Some(terms) => RecoveryTerms::Clean(terms),
            None => RecoveryTerms::NonClean,
        });
        durable_dirs.insert(dir_name);
    }
    let queues = queues_dir(data_dir);
    for dir_name in all_queue_directory_names(&queues)? {
        if !durable_dirs.contains(&dir_name) {
            info!("deleting orphan queue directory {dir_name}");
            std::fs::remove_dir_all(queues.join(&dir_name))?;
        }
    }
    terms_store.clear()?;
    let walker = Walker::spawn(data_dir.to_path_buf(), durable_queue_names.to_vec())?;
    Ok((ordered_terms, walker))
}

/// Iterator over `(msg_id, 1)` for every persistent un-acked publish
/// across all durable queues. Returns `None` once every worker has
/// finished and the gatherer is drained.
pub struct Walker {
    rx: Receiver<(MsgId, u64)>,
    workers: Vec<JoinHandle<()>>,
}

impl Walker {
    fn spawn(data_dir: PathBuf, queue_names: Vec<String>) -> Result<Walker> {
        let (tx, rx) = mpsc::sync_channel(GATHERER_CAPACITY);
        let worker_count = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .min(queue_names.len().max(1));
        let mut buckets: Vec<Vec<String>> = vec![Vec::new(); worker_count];
        for (i, name) in queue_names.into_iter().enumerate() {
            buckets[i % worker_count].push(name);
        }
        let mut workers = Vec::with_capacity(worker_count);
        for (worker_id, bucket) in buckets.into_iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            let tx = tx.clone();
            let data_dir = data_dir.clone();
            let handle = thread::Builder::new()
                .name(format!("index-walker-{worker_id}"))
                .spawn(move || {
                    for name in bucket {
                        if let Err(err) = walk_queue(&data_dir, &name, &tx) {
                            error!("queue index walk failed for {name}: {err}");
                        }
                    }
                })?;
            workers.push(handle);
        }
        drop(tx);
        Ok(Walker { rx, workers })
    }

    fn finish(&mut self) {
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Iterator for Walker {
    type Item = (MsgId, u64);

    fn next(&mut self) -> Option<(MsgId, u64)> {
        match self.rx.recv() {
            Ok(pair) => Some(pair),
            Err(_) => {
                self.finish();
                None
            }
        }
    }
}

impl Drop for Walker {
    fn drop(&mut self) {
        // Unblock any worker waiting on a full gatherer, then join.
        let (dead_tx, dead_rx) = mpsc::sync_channel(1);
        drop(dead_tx);
        let _ = std::mem::replace(&mut self.rx, dead_rx);
        self.finish();
    }
}

fn walk_queue(data_dir: &Path, queue_name: &str, tx: &SyncSender<(MsgId, u64)>) -> Result<()> {
    scan_queue_segments(data_dir, queue_name, true, |keep_going, _seq, publish, _del| {
        if keep_going && publish.is_persistent {
            // A send error means the consumer went away; stop emitting
            // but let the scan run out.
            tx.send((publish.msg.msg_id(), 1)).is_ok()
        } else {
            keep_going
        }
    })?;
    Ok(())
}
