//! Combining a segment file image with its journal overlay.
//!
//! `segment_plus_journal` produces the authoritative view of a segment
//! (used by reads and recovery); `journal_minus_segment` strips journal
//! replay of everything the segment file already records (used only at
//! dirty recovery). Both walk the clause tables of the slot lifecycle;
//! pairings outside the tables cannot arise from legal operation and are
//! skipped after a debug assertion rather than corrupting state.

use crate::codec::{SegmentEntries, Slot};

/// Overlay one segment's pending journal entries onto its file image,
/// in place. Returns the change to the unacked count relative to what
/// the file alone records.
pub fn segment_plus_journal(seg_entries: &mut SegmentEntries, overlay: &SegmentEntries) -> i64 {
    let mut delta = 0i64;
    for (rel, jslot) in overlay {
        let seg_shape = seg_entries
            .get(rel)
            .map(|slot| (slot.publish.is_some(), slot.del, slot.ack));
        match (seg_shape, (&jslot.publish, jslot.del, jslot.ack)) {
            (None, (Some(_), _, false)) => {
                seg_entries.insert(*rel, jslot.clone());
                delta += 1;
            }
            (None, (Some(_), true, true)) => {
                // Published, delivered and acked without ever being
                // flushed; nothing survives.
            }
            (Some((true, false, false)), (None, true, false)) => {
                if let Some(slot) = seg_entries.get_mut(rel) {
                    slot.del = true;
                }
            }
            (Some((true, false, false)), (None, true, true))
            | (Some((true, true, false)), (None, false, true)) => {
                seg_entries.remove(rel);
                delta -= 1;
            }
            _ => unreachable_merge("segment+journal", seg_entries.get(rel), jslot),
        }
    }
    delta
}

enum Cleanup {
    Keep,
    Remove,
    Replace(Slot),
}

/// Remove from a replayed journal overlay everything the segment file
/// already contains, shrinking partially-duplicated slots to their
/// delta. Returns the number of unacked entries that were counted by
/// both the replay and the file (to be subtracted when combining the
/// two counts).
pub fn journal_minus_segment(overlay: &mut SegmentEntries, seg_entries: &SegmentEntries) -> i64 {
    let mut duplicates = 0i64;
    let rels: Vec<u16> = overlay.keys().copied().collect();
    for rel in rels {
        let jslot = &overlay[&rel];
        let (cleanup, dup) = match seg_entries.get(&rel) {
            None => minus_missing_segment(jslot),
            Some(sslot) => match (sslot.del, sslot.ack) {
                (false, false) => minus_pub_only(jslot, sslot),
                (true, false) => minus_pub_del(jslot, sslot),
                (true, true) => minus_pub_del_ack(jslot, sslot),
                (false, true) => {
                    unreachable_merge("journal-segment", Some(sslot), jslot);
                    (Cleanup::Keep, 0)
                }
            },
        };
        duplicates += dup;
        match cleanup {
            Cleanup::Keep => {}
            Cleanup::Remove => {
                overlay.remove(&rel);
            }
            Cleanup::Replace(slot) => {
                overlay.insert(rel, slot);
            }
        }
    }
    duplicates
}

/// The segment file has no record for this rel.
fn minus_missing_segment(jslot: &Slot) -> (Cleanup, i64) {
    match (&jslot.publish, jslot.del, jslot.ack) {
        // Publish only reached the journal; the overlay is authoritative.
        (Some(_), _, _) => (Cleanup::Keep, 0),
        // A deliver/ack whose segment was already flushed and deleted:
        // the journal tail is stale, the message is long forgotten.
        (None, _, true) => (Cleanup::Remove, 0),
        (None, _, false) => {
            unreachable_merge("journal-segment", None, jslot);
            (Cleanup::Remove, 0)
        }
    }
}

/// The segment file has the publish, not yet delivered.
fn minus_pub_only(jslot: &Slot, sslot: &Slot) -> (Cleanup, i64) {
    match (&jslot.publish, jslot.del, jslot.ack) {
        (Some(publish), del, ack) if Some(publish) == sslot.publish.as_ref() => {
            if !del && !ack {
                (Cleanup::Remove, 1)
            } else {
                // The overlay holds the later state; shrink it to the
                // part the file lacks.
                (
                    Cleanup::Replace(Slot {
                        publish: None,
                        del,
                        ack,
                    }),
                    1,
                )
            }
        }
        (None, true, _) => (Cleanup::Keep, 0),
        _ => {
            unreachable_merge("journal-segment", Some(sslot), jslot);
            (Cleanup::Keep, 0)
        }
    }
}

/// The segment file has the publish and its delivery.
fn minus_pub_del(jslot: &Slot, sslot: &Slot) -> (Cleanup, i64) {
    match (&jslot.publish, jslot.del, jslot.ack) {
        (Some(publish), true, ack) if Some(publish) == sslot.publish.as_ref() => {
            if ack {
                (
                    Cleanup::Replace(Slot {
                        publish: None,
                        del: false,
                        ack: true,
                    }),
                    1,
                )
            } else {
                (Cleanup::Remove, 1)
            }
        }
        (None, true, false) => (Cleanup::Remove, 0),
        (None, false, true) => (Cleanup::Keep, 0),
        (None, true, true) => (
            Cleanup::Replace(Slot {
                publish: None,
                del: false,
                ack: true,
            }),
            0,
        ),
        _ => {
            unreachable_merge("journal-segment", Some(sslot), jslot);
            (Cleanup::Keep, 0)
        }
    }
}

/// The segment file already records the full lifecycle (loaded with
/// `keep_acked`). The replayed count went down by one for the ack the
/// file also holds, so those pairings return -1.
fn minus_pub_del_ack(jslot: &Slot, sslot: &Slot) -> (Cleanup, i64) {
    match (&jslot.publish, jslot.del, jslot.ack) {
        (Some(publish), true, true) if Some(publish) == sslot.publish.as_ref() => {
            (Cleanup::Remove, 0)
        }
        (None, _, true) => (Cleanup::Remove, -1),
        _ => {
            unreachable_merge("journal-segment", Some(sslot), jslot);
            (Cleanup::Keep, 0)
        }
    }
}

fn unreachable_merge(which: &str, sslot: Option<&Slot>, jslot: &Slot) {
    debug_assert!(
        false,
        "unreachable {which} pairing: segment {sslot:?}, journal {jslot:?}"
    );
    log::warn!("skipping unreachable {which} pairing: segment {sslot:?}, journal {jslot:?}");
}
