//! Segment files and their in-memory state.
//!
//! A segment covers a fixed range of 16384 consecutive sequence ids.
//! Its file holds publish and deliver-or-ack records for those ids; the
//! in-memory state additionally carries the journal overlay for the
//! range and the count of published-but-unacked messages, which drives
//! file deletion once it reaches zero.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::warn;

use crate::codec::{
    encode_segment_slot, seg_and_rel, SegmentEntries, SegmentParser, SegmentRecord, SeqId, Slot,
};
use crate::journal::{add_to_overlay, JournalAction};
use crate::Result;

pub const SEGMENT_EXTENSION: &str = "idx";

pub fn segment_filename(num: u64) -> String {
    format!("{num}.{SEGMENT_EXTENSION}")
}

pub fn segment_path(dir: &Path, num: u64) -> PathBuf {
    dir.join(segment_filename(num))
}

/// Parse a segment filename back into its number. Returns `None` for
/// anything that is not `<decimal>.idx`.
pub fn parse_segment_filename(name: &str) -> Option<u64> {
    let base = name.strip_suffix(".idx")?;
    if base.is_empty() || !base.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    base.parse::<u64>().ok()
}

/// Discover all segment numbers present in a queue directory, sorted.
pub fn discover_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if let Some(num) = parse_segment_filename(name) {
            segments.push(num);
        }
    }
    segments.sort_unstable();
    Ok(segments)
}

/// In-memory state of one segment.
pub struct Segment {
    pub num: u64,
    pub path: PathBuf,
    /// Pending journal mutations for this segment's sequence range.
    pub journal_entries: SegmentEntries,
    /// Published-but-unacked count across file and overlay. Signed:
    /// journal replay at recovery may transiently dip below zero before
    /// the file counts are folded in.
    pub unacked: i64,
}

impl Segment {
    pub fn new(num: u64, dir: &Path) -> Self {
        Segment {
            num,
            path: segment_path(dir, num),
            journal_entries: SegmentEntries::new(),
            unacked: 0,
        }
    }

    /// Route one journal action into this segment's overlay, keeping the
    /// unacked count in step: +1 per publish, -1 per ack.
    pub fn add_to_journal(&mut self, seq_id: SeqId, action: JournalAction) -> Result<()> {
        let (_, rel) = seg_and_rel(seq_id);
        let delta = match &action {
            JournalAction::Publish(_) => 1,
            JournalAction::Deliver => 0,
            JournalAction::Ack => -1,
        };
        add_to_overlay(&mut self.journal_entries, seq_id, rel, action)?;
        self.unacked += delta;
        Ok(())
    }

    /// Load the segment file into a sparse slot map.
    ///
    /// The first deliver-or-ack for a rel marks it delivered, the second
    /// acks it. With `keep_acked = false` an acked slot is erased; with
    /// `keep_acked = true` (recovery) it is kept so journal replay can be
    /// deduplicated against it. Returns the slot map and the unacked
    /// count as the file alone sees it.
    pub fn load(&self, keep_acked: bool) -> Result<(SegmentEntries, i64)> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok((SegmentEntries::new(), 0));
            }
            Err(err) => return Err(err.into()),
        };
        let mut entries = SegmentEntries::new();
        let mut unacked = 0i64;
        for record in SegmentParser::new(&bytes) {
            match record {
                SegmentRecord::Publish { rel, publish } => {
                    entries.insert(
                        rel,
                        Slot {
                            publish: Some(publish),
                            del: false,
                            ack: false,
                        },
                    );
                    unacked += 1;
                }
                SegmentRecord::DeliverOrAck { rel } => {
                    let shape = entries
                        .get(&rel)
                        .map(|slot| (slot.publish.is_some(), slot.del, slot.ack));
                    match shape {
                        Some((true, false, _)) => {
                            if let Some(slot) = entries.get_mut(&rel) {
                                slot.del = true;
                            }
                        }
                        Some((true, true, false)) => {
                            unacked -= 1;
                            if keep_acked {
                                if let Some(slot) = entries.get_mut(&rel) {
                                    slot.ack = true;
                                }
                            } else {
                                entries.remove(&rel);
                            }
                        }
                        _ => {
                            warn!(
                                "segment {}: deliver-or-ack for rel {rel} without matching \
                                 publish, truncating read",
                                self.path.display()
                            );
                            break;
                        }
                    }
                }
            }
        }
        Ok((entries, unacked))
    }

    /// Append every occupied overlay slot to the segment file in
    /// ascending rel order, then drop the overlay. Slots that encode to
    /// nothing (published-and-acked without ever touching disk) are
    /// skipped, and an overlay made only of such slots touches no file.
    pub fn append_overlay(&mut self) -> Result<()> {
        if self.journal_entries.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for (rel, slot) in &self.journal_entries {
            encode_segment_slot(&mut buf, *rel, slot);
        }
        if !buf.is_empty() {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            file.write_all(&buf)?;
        }
        self.journal_entries.clear();
        Ok(())
    }

    /// Remove the segment file if it exists. Fully-acked history leaves
    /// no on-disk trace.
    pub fn delete_file(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
