//! The per-queue index state machine.
//!
//! Coordinates the journal, the segment store and the merge logic into
//! the public surface the owning queue drives: publish, deliver, ack,
//! sync, flush, read, bounds, terminate, recover. The owning queue
//! serializes all calls; there is no internal locking.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::codec::{
    encode_journal_ack, encode_journal_deliver, encode_journal_publish, seg_and_rel, seq_id_from,
    JournalEntry, JournalParser, MessageProps, MsgId, MsgRef, Publish, SeqId,
    PUB_RECORD_SIZE_BYTES, SEGMENT_ENTRY_COUNT,
};
use crate::journal::{JournalAction, JournalHandle, JOURNAL_FILENAME};
use crate::layout::{queue_dir, queue_dir_name, queues_dir};
use crate::merge::{journal_minus_segment, segment_plus_journal};
use crate::recovery_terms::{QueueTerms, RecoveryTerms, RecoveryTermsStore};
use crate::segment::{discover_segments, Segment};
use crate::segment_store::SegmentStore;
use crate::{Error, Result};

pub const DEFAULT_MAX_JOURNAL_ENTRIES: u64 = 4096;

/// Callback invoked after a successful journal fsync with the set of
/// confirmed msg-ids.
pub type SyncCallback = Box<dyn FnMut(HashSet<MsgId>)>;

/// Index tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct IndexConfig {
    /// Logical journal entries tolerated before an implicit flush.
    pub max_journal_entries: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            max_journal_entries: DEFAULT_MAX_JOURNAL_ENTRIES,
        }
    }
}

/// Whether the journal has anything worth fsyncing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncNeed {
    /// Publisher confirms are waiting on an fsync.
    Confirms,
    /// Buffered journal writes exist but nobody awaits a confirm.
    Other,
    /// Nothing to do.
    None,
}

/// One published, not-yet-acked message returned by [`QueueIndex::read`].
#[derive(Clone, Debug, PartialEq)]
pub struct IndexEntry {
    pub msg: MsgRef,
    pub seq_id: SeqId,
    pub props: MessageProps,
    pub is_persistent: bool,
    pub is_delivered: bool,
}

pub struct QueueIndex {
    dir: PathBuf,
    dir_name: String,
    segments: SegmentStore,
    journal: Option<JournalHandle>,
    dirty_count: u64,
    max_journal_entries: u64,
    on_sync: SyncCallback,
    on_sync_msg: SyncCallback,
    unconfirmed: HashSet<MsgId>,
    unconfirmed_msg: HashSet<MsgId>,
}

impl QueueIndex {
    fn blank(
        data_dir: &Path,
        queue_name: &str,
        config: IndexConfig,
        on_sync: SyncCallback,
        on_sync_msg: SyncCallback,
    ) -> Self {
        let dir_name = queue_dir_name(queue_name);
        let dir = queues_dir(data_dir).join(&dir_name);
        QueueIndex {
            segments: SegmentStore::new(dir.clone()),
            dir,
            dir_name,
            journal: None,
            dirty_count: 0,
            max_journal_entries: config.max_journal_entries.max(1),
            on_sync,
            on_sync_msg,
            unconfirmed: HashSet::new(),
            unconfirmed_msg: HashSet::new(),
        }
    }

    /// Create the state for a brand-new queue under a broker data
    /// directory. The queue's directory must not exist yet; it appears
    /// on disk when the journal is first opened.
    pub fn init(
        data_dir: &Path,
        queue_name: &str,
        config: IndexConfig,
        on_sync: SyncCallback,
        on_sync_msg: SyncCallback,
    ) -> Result<Self> {
        let state = Self::blank(data_dir, queue_name, config, on_sync, on_sync_msg);
        if state.dir.exists() {
            return Err(Error::DirectoryExists(state.dir));
        }
        Ok(state)
    }

    /// Rebuild the state for an existing queue after a restart.
    ///
    /// With clean terms and a recovered message store the persisted
    /// per-segment counts are trusted and the counts returned are
    /// `None` (they would include transient messages the message store
    /// never saw). Otherwise the dirty path replays the journal,
    /// deduplicates it against the segment files, applies the recovery
    /// policy per message, and returns the surviving unacked count and
    /// persistent byte total.
    #[allow(clippy::too_many_arguments)]
    pub fn recover<F>(
        data_dir: &Path,
        queue_name: &str,
        terms: &RecoveryTerms,
        msg_store_recovered: bool,
        contains: F,
        config: IndexConfig,
        on_sync: SyncCallback,
        on_sync_msg: SyncCallback,
    ) -> Result<(Option<u64>, Option<u64>, Self)>
    where
        F: FnMut(&MsgId) -> bool,
    {
        let mut state = Self::blank(data_dir, queue_name, config, on_sync, on_sync_msg);
        let clean_shutdown = terms.is_clean();
        match terms {
            RecoveryTerms::Clean(queue_terms) if msg_store_recovered => {
                state.init_clean(queue_terms)?;
                Ok((None, None, state))
            }
            _ => {
                let (count, bytes) = state.init_dirty(clean_shutdown, contains)?;
                Ok((Some(count), Some(bytes), state))
            }
        }
    }

    fn init_clean(&mut self, terms: &QueueTerms) -> Result<()> {
        // The journal is normally empty after a clean shutdown but may
        // legally hold entries; replaying it recreates the overlay, and
        // the persisted counts then override the per-segment tallies
        // (they were taken from live state and already include the
        // journal's effect).
        self.load_journal()?;
        for &(seg, unacked) in &terms.segments {
            self.segments.get_or_new(seg).unacked = unacked as i64;
        }
        debug!(
            "queue index {}: clean recovery, {} segments",
            self.dir_name,
            terms.segments.len()
        );
        Ok(())
    }

    fn init_dirty<F>(&mut self, clean_shutdown: bool, mut contains: F) -> Result<(u64, u64)>
    where
        F: FnMut(&MsgId) -> bool,
    {
        self.recover_journal()?;
        let mut nums: BTreeSet<u64> = self.segments.keys().into_iter().collect();
        for num in discover_segments(&self.dir)? {
            nums.insert(num);
        }
        let mut count = 0u64;
        let mut bytes = 0u64;
        let mut dirty = 0u64;
        for seg_num in nums {
            let segment = self.segments.get_or_new(seg_num);
            let (mut entries, unacked_in_file) = segment.load(false)?;
            let delta = segment_plus_journal(&mut entries, &segment.journal_entries);
            segment.unacked = unacked_in_file + delta;
            for (rel, slot) in &entries {
                let Some(publish) = &slot.publish else { continue };
                if slot.ack {
                    continue;
                }
                let seq_id = seq_id_from(seg_num, *rel);
                // Embedded bodies travel with the index; only external
                // references can have lost their message-store entry.
                let in_store = match &publish.msg {
                    MsgRef::Embedded(_) => true,
                    MsgRef::Id(id) => contains(id),
                };
                // Recovery policy. After an unclean shutdown an
                // undelivered message the store still holds must be
                // treated as possibly delivered; a message the store no
                // longer holds is retired outright. These entries go
                // only to the in-memory overlay, never the journal file.
                match (in_store, clean_shutdown, slot.del) {
                    (true, true, _) | (true, false, true) => {}
                    (true, false, false) => {
                        segment.add_to_journal(seq_id, JournalAction::Deliver)?;
                        dirty += 1;
                    }
                    (false, _, true) => {
                        segment.add_to_journal(seq_id, JournalAction::Ack)?;
                        dirty += 1;
                    }
                    (false, _, false) => {
                        segment.add_to_journal(seq_id, JournalAction::Deliver)?;
                        segment.add_to_journal(seq_id, JournalAction::Ack)?;
                        dirty += 2;
                    }
                }
                if in_store && publish.is_persistent {
                    bytes += u64::from(publish.size);
                }
            }
            count += segment.unacked.max(0) as u64;
        }
        info!(
            "queue index {}: dirty recovery, {count} unacked across {} segments",
            self.dir_name,
            self.segments.len()
        );
        self.dirty_count = dirty;
        self.maybe_flush_journal(None)?;
        Ok((count, bytes))
    }

    /// Replay the on-disk journal into the per-segment overlays.
    fn load_journal(&mut self) -> Result<()> {
        let path = self.dir.join(JOURNAL_FILENAME);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        for entry in JournalParser::new(&bytes) {
            match entry {
                JournalEntry::Publish { seq_id, publish } => {
                    self.add_to_journal(seq_id, JournalAction::Publish(publish))?;
                }
                JournalEntry::Deliver { seq_id } => {
                    self.add_to_journal(seq_id, JournalAction::Deliver)?;
                }
                JournalEntry::Ack { seq_id } => {
                    self.add_to_journal(seq_id, JournalAction::Ack)?;
                }
            }
        }
        Ok(())
    }

    /// Load the journal, then strip each segment's overlay of entries
    /// its file already records, fixing up the unacked counts:
    /// replayed + from-file - duplicates.
    fn recover_journal(&mut self) -> Result<()> {
        self.load_journal()?;
        for segment in self.segments.iter_mut() {
            let (seg_entries, unacked_in_file) = segment.load(true)?;
            let duplicates = journal_minus_segment(&mut segment.journal_entries, &seg_entries);
            segment.unacked = segment.unacked + unacked_in_file - duplicates;
        }
        Ok(())
    }

    fn add_to_journal(&mut self, seq_id: SeqId, action: JournalAction) -> Result<()> {
        let (seg, _) = seg_and_rel(seq_id);
        self.segments.get_or_new(seg).add_to_journal(seq_id, action)?;
        self.dirty_count += 1;
        Ok(())
    }

    fn journal_handle(&mut self) -> Result<&mut JournalHandle> {
        if self.journal.is_none() {
            self.journal = Some(JournalHandle::open(&self.dir)?);
        }
        Ok(self.journal.as_mut().expect("journal handle just opened"))
    }

    /// Record a publish. The encoded entry is appended to the journal
    /// first, then mirrored into the overlay. Publishing the same
    /// sequence id twice is a caller bug.
    pub fn publish(
        &mut self,
        msg: MsgRef,
        seq_id: SeqId,
        props: MessageProps,
        is_persistent: bool,
        journal_size_hint: Option<u64>,
    ) -> Result<()> {
        if props.needs_confirming {
            let msg_id = msg.msg_id();
            if msg.is_embedded() {
                self.unconfirmed_msg.insert(msg_id);
            } else {
                self.unconfirmed.insert(msg_id);
            }
        }
        let publish = Publish {
            msg,
            expiry: props.expiry,
            size: props.size,
            is_persistent,
        };
        let mut buf = Vec::with_capacity(8 + PUB_RECORD_SIZE_BYTES);
        encode_journal_publish(&mut buf, seq_id, &publish);
        self.journal_handle()?.append(&buf);
        self.add_to_journal(seq_id, JournalAction::Publish(publish))?;
        self.maybe_flush_journal(journal_size_hint)
    }

    /// Record a batch of deliveries.
    pub fn deliver(&mut self, seq_ids: &[SeqId]) -> Result<()> {
        self.deliver_or_ack(seq_ids, false)
    }

    /// Record a batch of acknowledgements.
    pub fn ack(&mut self, seq_ids: &[SeqId]) -> Result<()> {
        self.deliver_or_ack(seq_ids, true)
    }

    fn deliver_or_ack(&mut self, seq_ids: &[SeqId], is_ack: bool) -> Result<()> {
        if seq_ids.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::with_capacity(seq_ids.len() * 8);
        for &seq_id in seq_ids {
            if is_ack {
                encode_journal_ack(&mut buf, seq_id);
            } else {
                encode_journal_deliver(&mut buf, seq_id);
            }
        }
        self.journal_handle()?.append(&buf);
        for &seq_id in seq_ids {
            let action = if is_ack {
                JournalAction::Ack
            } else {
                JournalAction::Deliver
            };
            self.add_to_journal(seq_id, action)?;
        }
        self.maybe_flush_journal(None)
    }

    /// Return every published, not-yet-acked message with sequence id in
    /// the half-open range `[start, end)`, ascending.
    pub fn read(&self, start: SeqId, end: SeqId) -> Result<Vec<IndexEntry>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let (start_seg, start_rel) = seg_and_rel(start);
        let (end_seg, end_rel) = seg_and_rel(end - 1);
        let mut out = Vec::new();
        for seg_num in start_seg..=end_seg {
            let untouched;
            let segment = match self.segments.find(seg_num) {
                Some(segment) => segment,
                None => {
                    untouched = Segment::new(seg_num, &self.dir);
                    &untouched
                }
            };
            let (mut entries, _) = segment.load(false)?;
            segment_plus_journal(&mut entries, &segment.journal_entries);
            for (rel, slot) in entries {
                if (seg_num == start_seg && rel < start_rel)
                    || (seg_num == end_seg && rel > end_rel)
                {
                    continue;
                }
                let Some(publish) = slot.publish else { continue };
                if slot.ack {
                    continue;
                }
                out.push(IndexEntry {
                    seq_id: seq_id_from(seg_num, rel),
                    props: publish.props(),
                    is_persistent: publish.is_persistent,
                    is_delivered: slot.del,
                    msg: publish.msg,
                });
            }
        }
        Ok(out)
    }

    /// `(low, next)`: the first sequence id of the lowest segment ever
    /// seen and the first id past the highest. `low` need not exist as a
    /// published slot. `(0, 0)` when no segment has been touched.
    pub fn bounds(&self) -> (SeqId, SeqId) {
        let keys = self.segments.keys();
        match (keys.first(), keys.last()) {
            (Some(&lowest), Some(&highest)) => (
                lowest * SEGMENT_ENTRY_COUNT,
                (highest + 1) * SEGMENT_ENTRY_COUNT,
            ),
            _ => (0, 0),
        }
    }

    /// Fsync the journal and fire the confirm callbacks. No-op when the
    /// journal was never opened.
    pub fn sync(&mut self) -> Result<()> {
        let Some(journal) = self.journal.as_mut() else {
            return Ok(());
        };
        journal.sync()?;
        self.notify_sync();
        Ok(())
    }

    pub fn needs_sync(&self) -> SyncNeed {
        let Some(journal) = &self.journal else {
            return SyncNeed::None;
        };
        if !self.unconfirmed.is_empty() || !self.unconfirmed_msg.is_empty() {
            SyncNeed::Confirms
        } else if journal.has_buffered() {
            SyncNeed::Other
        } else {
            SyncNeed::None
        }
    }

    /// Drain the overlay into the segment files and truncate the
    /// journal. Segments whose unacked count reached zero lose their
    /// file instead.
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty_count == 0 {
            return Ok(());
        }
        debug!(
            "queue index {}: flushing {} journal entries",
            self.dir_name, self.dirty_count
        );
        for segment in self.segments.iter_mut() {
            if segment.unacked <= 0 {
                segment.journal_entries.clear();
                segment.delete_file()?;
            } else {
                segment.append_overlay()?;
            }
        }
        self.journal_handle()?.clear()?;
        self.dirty_count = 0;
        self.notify_sync();
        Ok(())
    }

    fn maybe_flush_journal(&mut self, hint: Option<u64>) -> Result<()> {
        if self.dirty_count > self.max_journal_entries
            || hint.is_some_and(|h| self.dirty_count > h)
        {
            self.flush()?;
        }
        Ok(())
    }

    fn notify_sync(&mut self) {
        if !self.unconfirmed.is_empty() {
            let confirmed = std::mem::take(&mut self.unconfirmed);
            (self.on_sync)(confirmed);
        }
        if !self.unconfirmed_msg.is_empty() {
            let confirmed = std::mem::take(&mut self.unconfirmed_msg);
            (self.on_sync_msg)(confirmed);
        }
    }

    fn shutdown(&mut self) -> Result<Vec<(u64, u64)>> {
        if let Some(journal) = self.journal.take() {
            journal.close()?;
        }
        let mut counts: Vec<(u64, u64)> = self
            .segments
            .iter()
            .map(|segment| (segment.num, segment.unacked.max(0) as u64))
            .collect();
        counts.sort_unstable();
        Ok(counts)
    }

    /// Close the journal and persist the per-segment unacked counts,
    /// plus any caller-supplied terms, for the next clean recovery.
    /// Nothing is flushed.
    pub fn terminate(
        &mut self,
        extra: serde_json::Map<String, serde_json::Value>,
        store: &RecoveryTermsStore,
    ) -> Result<()> {
        let segments = self.shutdown()?;
        store.store(
            &self.dir_name,
            QueueTerms {
                segments,
                extra,
            },
        )
    }

    /// Terminate without persisting terms, deleting the queue's
    /// directory and everything in it.
    pub fn delete_and_terminate(&mut self) -> Result<()> {
        self.shutdown()?;
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }

    /// Remove a queue's directory without constructing its state.
    pub fn erase(data_dir: &Path, queue_name: &str) -> Result<()> {
        let dir = queue_dir(&queues_dir(data_dir), queue_name);
        if dir.is_dir() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Fold over every published, not-yet-acked entry of a queue's on-disk
/// index without modifying anything: journal replay, deduplication
/// against the segment files, then each segment merged with its
/// overlay. Used by the startup walker and usable by offline tooling.
pub fn scan_queue_segments<A, F>(
    data_dir: &Path,
    queue_name: &str,
    init: A,
    mut f: F,
) -> Result<A>
where
    F: FnMut(A, SeqId, &Publish, bool) -> A,
{
    let mut state = QueueIndex::blank(
        data_dir,
        queue_name,
        IndexConfig::default(),
        Box::new(|_| {}),
        Box::new(|_| {}),
    );
    state.recover_journal()?;
    let mut nums: BTreeSet<u64> = state.segments.keys().into_iter().collect();
    for num in discover_segments(&state.dir)? {
        nums.insert(num);
    }
    let mut acc = init;
    for seg_num in nums {
        let untouched;
        let segment = match state.segments.find(seg_num) {
            Some(segment) => segment,
            None => {
                untouched = Segment::new(seg_num, state.segments.dir());
                &untouched
            }
        };
        let (mut entries, _) = segment.load(false)?;
        segment_plus_journal(&mut entries, &segment.journal_entries);
        for (rel, slot) in &entries {
            let Some(publish) = &slot.publish else { continue };
            if slot.ack {
                continue;
            }
            acc = f(acc, seq_id_from(seg_num, *rel), publish, slot.del);
        }
    }
    Ok(acc)
}
