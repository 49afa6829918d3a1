use std::fs;
use std::path::Path;

use queue_index::layout::{queue_dir_name, queues_dir};
use queue_index::upgrade::{upgrade, CURRENT_FORMAT_VERSION, VERSION_FILENAME};
use queue_index::{IndexConfig, MsgId, MsgRef, QueueIndex, RecoveryTerms, SyncCallback};
use tempfile::tempdir;

fn noop() -> SyncCallback {
    Box::new(|_| {})
}

fn recover(data_dir: &Path, name: &str) -> (Option<u64>, Option<u64>, QueueIndex) {
    QueueIndex::recover(
        data_dir,
        name,
        &RecoveryTerms::NonClean,
        false,
        |_| true,
        IndexConfig::default(),
        noop(),
        noop(),
    )
    .expect("recover")
}

/// First-format journal publish: prefix+seq word, then just the msg-id.
fn v1_journal_publish(seq: u64, msg_id: [u8; 16]) -> Vec<u8> {
    let mut out = seq.to_be_bytes().to_vec();
    out.extend_from_slice(&msg_id);
    out
}

/// First-format segment publish: header word, then just the msg-id.
fn v1_segment_publish(rel: u16, msg_id: [u8; 16]) -> Vec<u8> {
    let mut out = (0xc000u16 | rel).to_be_bytes().to_vec();
    out.extend_from_slice(&msg_id);
    out
}

fn rel_record(rel: u16) -> [u8; 2] {
    (0x4000u16 | rel).to_be_bytes()
}

#[test]
fn v1_files_upgrade_to_current_and_recover() {
    let tmp = tempdir().expect("tempdir");
    let data_dir = tmp.path();
    let queues = queues_dir(data_dir);
    let queue_dir = queues.join(queue_dir_name("legacy"));
    fs::create_dir_all(&queue_dir).expect("mkdir");

    let journal = v1_journal_publish(2, [0xaa; 16]);
    fs::write(queue_dir.join("journal.jif"), &journal).expect("write journal");

    let mut segment = Vec::new();
    segment.extend_from_slice(&v1_segment_publish(0, [0xbb; 16]));
    segment.extend_from_slice(&rel_record(0));
    segment.extend_from_slice(&v1_segment_publish(1, [0xcc; 16]));
    fs::write(queue_dir.join("0.idx"), &segment).expect("write segment");

    upgrade(data_dir).expect("upgrade");

    assert_eq!(
        fs::read_to_string(queues.join(VERSION_FILENAME)).expect("marker"),
        CURRENT_FORMAT_VERSION.to_string()
    );
    // Every publish grew by the expiry, size and embedded-size fields.
    assert_eq!(
        fs::read(queue_dir.join("journal.jif")).expect("read").len(),
        journal.len() + 16
    );
    assert_eq!(
        fs::read(queue_dir.join("0.idx")).expect("read").len(),
        segment.len() + 32
    );

    let (count, bytes, index) = recover(data_dir, "legacy");
    assert_eq!(count, Some(3));
    // The size field did not exist in v1; it defaults to zero.
    assert_eq!(bytes, Some(0));
    let entries = index.read(0, 16384).expect("read");
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].msg, MsgRef::Id(MsgId([0xbb; 16])));
    assert_eq!(entries[1].msg, MsgRef::Id(MsgId([0xcc; 16])));
    assert_eq!(entries[2].msg, MsgRef::Id(MsgId([0xaa; 16])));
    for entry in &entries {
        assert_eq!(entry.props.expiry, None);
        assert_eq!(entry.props.size, 0);
        assert!(entry.is_persistent);
    }
}

#[test]
fn upgrade_is_idempotent_across_boots() {
    let tmp = tempdir().expect("tempdir");
    let data_dir = tmp.path();
    let queue_dir = queues_dir(data_dir).join(queue_dir_name("legacy"));
    fs::create_dir_all(&queue_dir).expect("mkdir");
    fs::write(
        queue_dir.join("journal.jif"),
        v1_journal_publish(0, [0x11; 16]),
    )
    .expect("write journal");

    upgrade(data_dir).expect("upgrade");
    let once = fs::read(queue_dir.join("journal.jif")).expect("read");
    upgrade(data_dir).expect("upgrade again");
    let twice = fs::read(queue_dir.join("journal.jif")).expect("read");
    assert_eq!(once, twice);
}

#[test]
fn padded_v2_segment_loses_its_zero_tail() {
    let tmp = tempdir().expect("tempdir");
    let data_dir = tmp.path();
    let queues = queues_dir(data_dir);
    let queue_dir = queues.join(queue_dir_name("legacy"));
    fs::create_dir_all(&queue_dir).expect("mkdir");
    fs::write(queues.join(VERSION_FILENAME), "2").expect("write marker");

    // v2 segment publish: header, msg-id, expiry; then the zero padding
    // that format wrote out to the end of the file.
    let mut segment = (0xc000u16 | 5).to_be_bytes().to_vec();
    segment.extend_from_slice(&[0xdd; 16]);
    segment.extend_from_slice(&42u64.to_be_bytes());
    segment.extend_from_slice(&[0u8; 64]);
    fs::write(queue_dir.join("0.idx"), &segment).expect("write segment");

    upgrade(data_dir).expect("upgrade");

    // Record grew by size + embedded-size; the padding is gone.
    assert_eq!(
        fs::read(queue_dir.join("0.idx")).expect("read").len(),
        2 + 16 + 8 + 4 + 4
    );
    let (count, _, index) = recover(data_dir, "legacy");
    assert_eq!(count, Some(1));
    let entries = index.read(0, 16384).expect("read");
    assert_eq!(entries[0].seq_id, 5);
    assert_eq!(entries[0].props.expiry, Some(42));
}

#[test]
fn zero_length_files_are_skipped() {
    let tmp = tempdir().expect("tempdir");
    let data_dir = tmp.path();
    let queue_dir = queues_dir(data_dir).join(queue_dir_name("empty"));
    fs::create_dir_all(&queue_dir).expect("mkdir");
    fs::write(queue_dir.join("journal.jif"), b"").expect("write journal");
    fs::write(queue_dir.join("0.idx"), b"").expect("write segment");

    upgrade(data_dir).expect("upgrade");
    assert_eq!(fs::metadata(queue_dir.join("journal.jif")).expect("meta").len(), 0);
    assert_eq!(fs::metadata(queue_dir.join("0.idx")).expect("meta").len(), 0);

    let (count, _, _) = recover(data_dir, "empty");
    assert_eq!(count, Some(0));
}

#[test]
fn fresh_tree_is_stamped_current_without_rewrites() {
    let tmp = tempdir().expect("tempdir");
    upgrade(tmp.path()).expect("upgrade");
    assert_eq!(
        fs::read_to_string(queues_dir(tmp.path()).join(VERSION_FILENAME)).expect("marker"),
        CURRENT_FORMAT_VERSION.to_string()
    );
}
