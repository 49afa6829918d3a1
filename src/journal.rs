//! Append-only journal of recent publish/deliver/ack mutations.
//!
//! Every public mutation is appended here before it touches the
//! in-memory overlay; the file is drained into segment files on flush.
//! Appends accumulate in a write buffer and reach the file only on
//! `sync`, `clear` or close, so a single fsync covers any number of
//! mutations.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::codec::{Publish, SegmentEntries, SeqId, Slot};
use crate::{Error, Result};

pub const JOURNAL_FILENAME: &str = "journal.jif";

/// One logical journal mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum JournalAction {
    Publish(Publish),
    Deliver,
    Ack,
}

/// Buffered handle to a queue's `journal.jif`.
///
/// Opening creates the queue directory; the directory appears on disk
/// the first time the journal is needed, not at `init`.
pub struct JournalHandle {
    file: File,
    buf: Vec<u8>,
}

impl JournalHandle {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(JOURNAL_FILENAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(JournalHandle {
            file,
            buf: Vec::new(),
        })
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn has_buffered(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Write out buffered appends and fsync.
    pub fn sync(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.file.write_all(&self.buf)?;
            self.buf.clear();
        }
        self.file.sync_data()?;
        Ok(())
    }

    /// Drop buffered appends and truncate the file to zero length. Used
    /// after the overlay has been drained into segment files.
    pub fn clear(&mut self) -> Result<()> {
        self.buf.clear();
        self.file.set_len(0)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Flush and fsync before closing; dropping the handle afterwards
    /// releases the descriptor.
    pub fn close(mut self) -> Result<()> {
        self.sync()
    }
}

/// Apply one journal action to a segment overlay, enforcing the legal
/// slot transitions. Any other combination is a programmer error: the
/// caller must never ack an undelivered message, deliver twice, or
/// re-publish a sequence id.
pub fn add_to_overlay(
    entries: &mut SegmentEntries,
    seq_id: SeqId,
    rel: u16,
    action: JournalAction,
) -> Result<()> {
    let shape = entries
        .get(&rel)
        .map(|slot| (slot.publish.is_some(), slot.del, slot.ack));
    match (shape, action) {
        (None, action) => {
            let slot = match action {
                JournalAction::Publish(publish) => Slot {
                    publish: Some(publish),
                    del: false,
                    ack: false,
                },
                JournalAction::Deliver => Slot {
                    publish: None,
                    del: true,
                    ack: false,
                },
                JournalAction::Ack => Slot {
                    publish: None,
                    del: false,
                    ack: true,
                },
            };
            entries.insert(rel, slot);
            Ok(())
        }
        (Some((true, false, false)), JournalAction::Deliver) => {
            if let Some(slot) = entries.get_mut(&rel) {
                slot.del = true;
            }
            Ok(())
        }
        (Some((false, true, false)), JournalAction::Ack) => {
            if let Some(slot) = entries.get_mut(&rel) {
                slot.ack = true;
            }
            Ok(())
        }
        (Some((true, true, false)), JournalAction::Ack) => {
            // The whole lifecycle happened inside the journal; the slot
            // vanishes and nothing ever reaches the segment.
            entries.remove(&rel);
            Ok(())
        }
        (shape, action) => {
            debug_assert!(
                false,
                "illegal overlay transition for seq {seq_id}: {action:?} on {shape:?}"
            );
            Err(Error::IllegalTransition { seq_id })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{MsgId, MsgRef};

    fn publish() -> Publish {
        Publish {
            msg: MsgRef::Id(MsgId([1; 16])),
            expiry: None,
            size: 10,
            is_persistent: true,
        }
    }

    fn slot(entries: &SegmentEntries, rel: u16) -> &Slot {
        entries.get(&rel).expect("slot present")
    }

    #[test]
    fn full_lifecycle_in_overlay_leaves_no_entry() {
        let mut entries = SegmentEntries::new();
        add_to_overlay(&mut entries, 0, 0, JournalAction::Publish(publish())).expect("publish");
        add_to_overlay(&mut entries, 0, 0, JournalAction::Deliver).expect("deliver");
        assert!(slot(&entries, 0).del);
        add_to_overlay(&mut entries, 0, 0, JournalAction::Ack).expect("ack");
        assert!(entries.is_empty());
    }

    #[test]
    fn deliver_then_ack_without_publish() {
        // The publish already lives in the segment file.
        let mut entries = SegmentEntries::new();
        add_to_overlay(&mut entries, 3, 3, JournalAction::Deliver).expect("deliver");
        add_to_overlay(&mut entries, 3, 3, JournalAction::Ack).expect("ack");
        let s = slot(&entries, 3);
        assert!(s.publish.is_none() && s.del && s.ack);
    }

    #[test]
    fn bare_ack_on_empty_slot() {
        let mut entries = SegmentEntries::new();
        add_to_overlay(&mut entries, 4, 4, JournalAction::Ack).expect("ack");
        let s = slot(&entries, 4);
        assert!(s.publish.is_none() && !s.del && s.ack);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "illegal overlay transition"))]
    fn double_deliver_is_rejected() {
        let mut entries = SegmentEntries::new();
        add_to_overlay(&mut entries, 0, 0, JournalAction::Publish(publish())).expect("publish");
        add_to_overlay(&mut entries, 0, 0, JournalAction::Deliver).expect("deliver");
        let result = add_to_overlay(&mut entries, 0, 0, JournalAction::Deliver);
        assert!(matches!(
            result,
            Err(Error::IllegalTransition { seq_id: 0 })
        ));
    }

    #[test]
    fn handle_buffers_until_sync() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue_dir = dir.path().join("q");
        let mut handle = JournalHandle::open(&queue_dir).expect("open");
        handle.append(b"abcd");
        assert!(handle.has_buffered());
        assert_eq!(
            std::fs::read(queue_dir.join(JOURNAL_FILENAME)).expect("read"),
            b""
        );
        handle.sync().expect("sync");
        assert!(!handle.has_buffered());
        assert_eq!(
            std::fs::read(queue_dir.join(JOURNAL_FILENAME)).expect("read"),
            b"abcd"
        );
        handle.clear().expect("clear");
        assert_eq!(
            std::fs::read(queue_dir.join(JOURNAL_FILENAME)).expect("read"),
            b""
        );
    }
}
