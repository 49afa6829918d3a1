//! Record layouts shared by the journal and segment files.
//!
//! Both files are flat concatenations of variable-length records. All
//! integers are big-endian. Journal entries carry the full 62-bit
//! sequence id; segment entries carry only the 14-bit sequence offset
//! within their segment.

use std::collections::BTreeMap;
use std::fmt;

/// A queue-assigned sequence id. 62 usable bits; monotonic per queue but
/// not necessarily contiguous.
pub type SeqId = u64;

/// Number of consecutive sequence ids covered by one segment file.
pub const SEGMENT_ENTRY_COUNT: u64 = 16384;

pub const MSG_ID_BYTES: usize = 16;
pub const EXPIRY_BYTES: usize = 8;
pub const SIZE_BYTES: usize = 4;
pub const EMBEDDED_SIZE_BYTES: usize = 4;

/// Fixed publish body: msg-id, expiry, size.
pub const PUB_RECORD_BODY_BYTES: usize = MSG_ID_BYTES + EXPIRY_BYTES + SIZE_BYTES;
/// Publish body plus the embedded-size field.
pub const PUB_RECORD_SIZE_BYTES: usize = PUB_RECORD_BODY_BYTES + EMBEDDED_SIZE_BYTES;

pub(crate) const SEQ_ID_BITS: u32 = 62;
pub(crate) const SEQ_ID_MASK: u64 = (1 << SEQ_ID_BITS) - 1;

// Journal entry kinds, the top two bits of the leading word.
pub(crate) const JPREFIX_PUB_PERSISTENT: u8 = 0b00;
pub(crate) const JPREFIX_PUB_TRANSIENT: u8 = 0b01;
pub(crate) const JPREFIX_DELIVER: u8 = 0b10;
pub(crate) const JPREFIX_ACK: u8 = 0b11;

// Segment entry headers, one big-endian u16.
pub(crate) const SEG_PUB_BIT: u16 = 0x8000;
pub(crate) const SEG_PERSISTENT_BIT: u16 = 0x4000;
pub(crate) const SEG_KIND_MASK: u16 = 0xc000;
pub(crate) const SEG_REL_ONLY_PREFIX: u16 = 0x4000;
pub(crate) const REL_SEQ_MASK: u16 = 0x3fff;

/// Split a sequence id into its segment number and in-segment offset.
pub fn seg_and_rel(seq_id: SeqId) -> (u64, u16) {
    (
        seq_id / SEGMENT_ENTRY_COUNT,
        (seq_id % SEGMENT_ENTRY_COUNT) as u16,
    )
}

/// Rebuild a sequence id from segment number and in-segment offset.
pub fn seq_id_from(seg: u64, rel: u16) -> SeqId {
    seg * SEGMENT_ENTRY_COUNT + u64::from(rel)
}

/// First sequence id of the segment after the one holding `seq_id`.
pub fn next_segment_boundary(seq_id: SeqId) -> SeqId {
    (seq_id / SEGMENT_ENTRY_COUNT + 1) * SEGMENT_ENTRY_COUNT
}

/// 16-byte message identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MsgId(pub [u8; MSG_ID_BYTES]);

impl MsgId {
    pub fn as_bytes(&self) -> &[u8; MSG_ID_BYTES] {
        &self.0
    }
}

impl fmt::Debug for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MsgId(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Properties attached to a publish. `needs_confirming` is not persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct MessageProps {
    pub expiry: Option<u64>,
    pub size: u32,
    pub needs_confirming: bool,
}

/// A message whose body is embedded in the index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: MsgId,
    pub body: Vec<u8>,
}

/// A published message, either by reference into the external message
/// store or with its body embedded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MsgRef {
    Id(MsgId),
    Embedded(Message),
}

impl MsgRef {
    pub fn msg_id(&self) -> MsgId {
        match self {
            MsgRef::Id(id) => *id,
            MsgRef::Embedded(msg) => msg.id,
        }
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self, MsgRef::Embedded(_))
    }
}

/// The publish half of a slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Publish {
    pub msg: MsgRef,
    pub expiry: Option<u64>,
    pub size: u32,
    pub is_persistent: bool,
}

impl Publish {
    pub fn props(&self) -> MessageProps {
        MessageProps {
            expiry: self.expiry,
            size: self.size,
            needs_confirming: false,
        }
    }
}

/// Tri-state record for one sequence slot. Absence from the containing
/// map is the empty state; `publish == None` forms occur only as journal
/// overlay entries whose publish lives in the segment file.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Slot {
    pub publish: Option<Publish>,
    pub del: bool,
    pub ack: bool,
}

/// Sparse per-segment slot map keyed by relative sequence.
pub type SegmentEntries = BTreeMap<u16, Slot>;

/// One decoded journal entry.
#[derive(Clone, Debug, PartialEq)]
pub enum JournalEntry {
    Publish { seq_id: SeqId, publish: Publish },
    Deliver { seq_id: SeqId },
    Ack { seq_id: SeqId },
}

/// One decoded segment entry.
#[derive(Clone, Debug, PartialEq)]
pub enum SegmentRecord {
    Publish { rel: u16, publish: Publish },
    DeliverOrAck { rel: u16 },
}

fn journal_word(kind: u8, seq_id: SeqId) -> [u8; 8] {
    debug_assert!(seq_id <= SEQ_ID_MASK, "sequence id exceeds 62 bits");
    ((u64::from(kind) << SEQ_ID_BITS) | (seq_id & SEQ_ID_MASK)).to_be_bytes()
}

fn encode_pub_body(buf: &mut Vec<u8>, publish: &Publish) {
    buf.extend_from_slice(publish.msg.msg_id().as_bytes());
    buf.extend_from_slice(&publish.expiry.unwrap_or(0).to_be_bytes());
    buf.extend_from_slice(&publish.size.to_be_bytes());
    match &publish.msg {
        MsgRef::Id(_) => buf.extend_from_slice(&0u32.to_be_bytes()),
        MsgRef::Embedded(msg) => {
            buf.extend_from_slice(&(msg.body.len() as u32).to_be_bytes());
            buf.extend_from_slice(&msg.body);
        }
    }
}

fn parse_pub_body(bytes: &[u8], is_persistent: bool) -> Option<(Publish, usize)> {
    if bytes.len() < PUB_RECORD_SIZE_BYTES {
        return None;
    }
    let msg_id = MsgId(bytes[0..16].try_into().expect("slice length"));
    let expiry_raw = u64::from_be_bytes(bytes[16..24].try_into().expect("slice length"));
    let size = u32::from_be_bytes(bytes[24..28].try_into().expect("slice length"));
    let embedded = u32::from_be_bytes(bytes[28..32].try_into().expect("slice length")) as usize;
    if bytes.len() < PUB_RECORD_SIZE_BYTES + embedded {
        return None;
    }
    let msg = if embedded == 0 {
        MsgRef::Id(msg_id)
    } else {
        MsgRef::Embedded(Message {
            id: msg_id,
            body: bytes[PUB_RECORD_SIZE_BYTES..PUB_RECORD_SIZE_BYTES + embedded].to_vec(),
        })
    };
    Some((
        Publish {
            msg,
            expiry: (expiry_raw != 0).then_some(expiry_raw),
            size,
            is_persistent,
        },
        PUB_RECORD_SIZE_BYTES + embedded,
    ))
}

pub fn encode_journal_publish(buf: &mut Vec<u8>, seq_id: SeqId, publish: &Publish) {
    let kind = if publish.is_persistent {
        JPREFIX_PUB_PERSISTENT
    } else {
        JPREFIX_PUB_TRANSIENT
    };
    buf.extend_from_slice(&journal_word(kind, seq_id));
    encode_pub_body(buf, publish);
}

pub fn encode_journal_deliver(buf: &mut Vec<u8>, seq_id: SeqId) {
    buf.extend_from_slice(&journal_word(JPREFIX_DELIVER, seq_id));
}

pub fn encode_journal_ack(buf: &mut Vec<u8>, seq_id: SeqId) {
    buf.extend_from_slice(&journal_word(JPREFIX_ACK, seq_id));
}

/// Streaming journal parser. Stops (returns `None`) at the first record
/// that is truncated or reads as dirty-shutdown zero padding; everything
/// yielded before that point is valid.
pub struct JournalParser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> JournalParser<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        JournalParser { buf, pos: 0 }
    }

    fn is_zero_padding(&self) -> bool {
        // A zero leading word would read as a persistent publish of
        // sequence id 0; it only counts as padding when the whole fixed
        // publish body behind it is zero too.
        let rest = &self.buf[self.pos + 8..];
        rest.len() >= PUB_RECORD_SIZE_BYTES
            && rest[..PUB_RECORD_SIZE_BYTES].iter().all(|&b| b == 0)
    }
}

impl Iterator for JournalParser<'_> {
    type Item = JournalEntry;

    fn next(&mut self) -> Option<JournalEntry> {
        if self.pos + 8 > self.buf.len() {
            return None;
        }
        let word = u64::from_be_bytes(
            self.buf[self.pos..self.pos + 8]
                .try_into()
                .expect("slice length"),
        );
        let kind = (word >> SEQ_ID_BITS) as u8;
        let seq_id = word & SEQ_ID_MASK;
        match kind {
            JPREFIX_DELIVER => {
                self.pos += 8;
                Some(JournalEntry::Deliver { seq_id })
            }
            JPREFIX_ACK => {
                self.pos += 8;
                Some(JournalEntry::Ack { seq_id })
            }
            _ => {
                if word == 0 && self.is_zero_padding() {
                    return None;
                }
                let (publish, consumed) = parse_pub_body(
                    &self.buf[self.pos + 8..],
                    kind == JPREFIX_PUB_PERSISTENT,
                )?;
                self.pos += 8 + consumed;
                Some(JournalEntry::Publish { seq_id, publish })
            }
        }
    }
}

/// Streaming segment-file parser. Stops at end-of-file, at zero tail
/// padding, or at the first unparseable record.
pub struct SegmentParser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SegmentParser<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        SegmentParser { buf, pos: 0 }
    }
}

impl Iterator for SegmentParser<'_> {
    type Item = SegmentRecord;

    fn next(&mut self) -> Option<SegmentRecord> {
        if self.pos + 2 > self.buf.len() {
            return None;
        }
        let header = u16::from_be_bytes(
            self.buf[self.pos..self.pos + 2]
                .try_into()
                .expect("slice length"),
        );
        let rel = header & REL_SEQ_MASK;
        if header & SEG_PUB_BIT != 0 {
            let (publish, consumed) = parse_pub_body(
                &self.buf[self.pos + 2..],
                header & SEG_PERSISTENT_BIT != 0,
            )?;
            self.pos += 2 + consumed;
            Some(SegmentRecord::Publish { rel, publish })
        } else if header & SEG_KIND_MASK == SEG_REL_ONLY_PREFIX {
            self.pos += 2;
            Some(SegmentRecord::DeliverOrAck { rel })
        } else {
            // Top bits 00: dirty-shutdown padding or corruption.
            None
        }
    }
}

/// Append the segment-file encoding of one overlay slot.
///
/// A fully acked slot that still carries its publish never needs to
/// reach disk and encodes to nothing. Otherwise the publish (if any) is
/// written first, then one deliver-or-ack record for `del` and a second
/// one for `ack`.
pub fn encode_segment_slot(buf: &mut Vec<u8>, rel: u16, slot: &Slot) {
    debug_assert_eq!(rel & REL_SEQ_MASK, rel, "relative sequence exceeds 14 bits");
    if slot.publish.is_some() && slot.del && slot.ack {
        return;
    }
    if let Some(publish) = &slot.publish {
        let mut header = SEG_PUB_BIT | rel;
        if publish.is_persistent {
            header |= SEG_PERSISTENT_BIT;
        }
        buf.extend_from_slice(&header.to_be_bytes());
        encode_pub_body(buf, publish);
    }
    let rel_only = (SEG_REL_ONLY_PREFIX | rel).to_be_bytes();
    if slot.del {
        buf.extend_from_slice(&rel_only);
    }
    if slot.ack {
        buf.extend_from_slice(&rel_only);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg_id(byte: u8) -> MsgId {
        MsgId([byte; 16])
    }

    fn publish(byte: u8, persistent: bool) -> Publish {
        Publish {
            msg: MsgRef::Id(msg_id(byte)),
            expiry: None,
            size: 100,
            is_persistent: persistent,
        }
    }

    #[test]
    fn journal_round_trip() {
        let mut buf = Vec::new();
        let embedded = Publish {
            msg: MsgRef::Embedded(Message {
                id: msg_id(2),
                body: b"payload".to_vec(),
            }),
            expiry: Some(12345),
            size: 7,
            is_persistent: true,
        };
        encode_journal_publish(&mut buf, 3, &publish(1, true));
        encode_journal_publish(&mut buf, (1 << 62) - 1, &embedded);
        encode_journal_deliver(&mut buf, 3);
        encode_journal_ack(&mut buf, 3);

        let entries: Vec<_> = JournalParser::new(&buf).collect();
        assert_eq!(
            entries,
            vec![
                JournalEntry::Publish {
                    seq_id: 3,
                    publish: publish(1, true)
                },
                JournalEntry::Publish {
                    seq_id: (1 << 62) - 1,
                    publish: embedded
                },
                JournalEntry::Deliver { seq_id: 3 },
                JournalEntry::Ack { seq_id: 3 },
            ]
        );
    }

    #[test]
    fn journal_transient_prefix_round_trips() {
        let mut buf = Vec::new();
        encode_journal_publish(&mut buf, 9, &publish(4, false));
        let entries: Vec<_> = JournalParser::new(&buf).collect();
        assert_eq!(
            entries,
            vec![JournalEntry::Publish {
                seq_id: 9,
                publish: publish(4, false)
            }]
        );
    }

    #[test]
    fn journal_stops_at_zero_padding() {
        let mut buf = Vec::new();
        encode_journal_deliver(&mut buf, 5);
        buf.extend_from_slice(&[0u8; 64]);
        let entries: Vec<_> = JournalParser::new(&buf).collect();
        assert_eq!(entries, vec![JournalEntry::Deliver { seq_id: 5 }]);
    }

    #[test]
    fn all_zero_journal_reads_as_empty() {
        let buf = [0u8; 128];
        assert_eq!(JournalParser::new(&buf).count(), 0);
    }

    #[test]
    fn zero_seq_id_publish_with_nonzero_body_is_not_padding() {
        // Sequence id 0 with a persistent prefix encodes to an all-zero
        // leading word; the non-zero msg-id keeps it a real publish.
        let mut buf = Vec::new();
        encode_journal_publish(&mut buf, 0, &publish(0xaa, true));
        let entries: Vec<_> = JournalParser::new(&buf).collect();
        assert_eq!(
            entries,
            vec![JournalEntry::Publish {
                seq_id: 0,
                publish: publish(0xaa, true)
            }]
        );
    }

    #[test]
    fn journal_stops_at_truncated_publish() {
        let mut buf = Vec::new();
        encode_journal_deliver(&mut buf, 1);
        encode_journal_publish(&mut buf, 2, &publish(3, true));
        buf.truncate(8 + 8 + 10);
        let entries: Vec<_> = JournalParser::new(&buf).collect();
        assert_eq!(entries, vec![JournalEntry::Deliver { seq_id: 1 }]);
    }

    #[test]
    fn journal_stops_at_truncated_embedded_body() {
        let mut buf = Vec::new();
        let embedded = Publish {
            msg: MsgRef::Embedded(Message {
                id: msg_id(6),
                body: vec![0xee; 32],
            }),
            expiry: None,
            size: 32,
            is_persistent: true,
        };
        encode_journal_publish(&mut buf, 7, &embedded);
        buf.truncate(buf.len() - 1);
        assert_eq!(JournalParser::new(&buf).count(), 0);
    }

    #[test]
    fn segment_round_trip() {
        let mut buf = Vec::new();
        let slot = Slot {
            publish: Some(publish(1, true)),
            del: true,
            ack: false,
        };
        encode_segment_slot(&mut buf, 42, &slot);
        let records: Vec<_> = SegmentParser::new(&buf).collect();
        assert_eq!(
            records,
            vec![
                SegmentRecord::Publish {
                    rel: 42,
                    publish: publish(1, true)
                },
                SegmentRecord::DeliverOrAck { rel: 42 },
            ]
        );
    }

    #[test]
    fn segment_acked_without_publish_writes_two_rel_records() {
        let mut buf = Vec::new();
        let slot = Slot {
            publish: None,
            del: true,
            ack: true,
        };
        encode_segment_slot(&mut buf, 7, &slot);
        let records: Vec<_> = SegmentParser::new(&buf).collect();
        assert_eq!(
            records,
            vec![
                SegmentRecord::DeliverOrAck { rel: 7 },
                SegmentRecord::DeliverOrAck { rel: 7 },
            ]
        );
    }

    #[test]
    fn segment_fully_acked_publish_encodes_to_nothing() {
        let mut buf = Vec::new();
        let slot = Slot {
            publish: Some(publish(1, false)),
            del: true,
            ack: true,
        };
        encode_segment_slot(&mut buf, 16383, &slot);
        assert!(buf.is_empty());
    }

    #[test]
    fn segment_stops_at_zero_padding() {
        let mut buf = Vec::new();
        encode_segment_slot(
            &mut buf,
            1,
            &Slot {
                publish: Some(publish(9, true)),
                del: false,
                ack: false,
            },
        );
        buf.extend_from_slice(&[0u8; 8]);
        assert_eq!(SegmentParser::new(&buf).count(), 1);
    }

    #[test]
    fn segment_boundaries() {
        assert_eq!(next_segment_boundary(0), 16384);
        assert_eq!(next_segment_boundary(16383), 16384);
        assert_eq!(next_segment_boundary(16384), 32768);
        assert_eq!(seg_and_rel(16384), (1, 0));
        assert_eq!(seg_and_rel(16383), (0, 16383));
        assert_eq!(seq_id_from(2, 5), 32773);
    }

    #[test]
    fn expiry_zero_means_none() {
        let mut buf = Vec::new();
        let mut p = publish(1, true);
        p.expiry = None;
        encode_journal_publish(&mut buf, 1, &p);
        match JournalParser::new(&buf).next() {
            Some(JournalEntry::Publish { publish, .. }) => assert_eq!(publish.expiry, None),
            other => panic!("unexpected entry: {other:?}"),
        }
    }
}
