//! Streaming upgrades between historical index file formats.
//!
//! Each upgrader is a pair of byte-stream rewriters, one for journals
//! and one for segment files, that insert a newly-introduced field with
//! its default value (or, for `avoid_zeroes`, strip the zero padding
//! older segment files carried). Files are rewritten to a `.upgrade`
//! sibling and renamed over the original. A version marker in the
//! queues directory keeps the transforms from running twice.
//!
//! Format history:
//!   v1  publish records carry only the msg-id
//!   v2  `add_queue_ttl`  adds the 8-byte expiry
//!   v3  `avoid_zeroes`   drops zero padding from segment files
//!   v4  `store_msg_size` adds the 4-byte size
//!   v5  `store_msg`      adds the 4-byte embedded-size (current)

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use log::info;

use crate::codec::{
    EXPIRY_BYTES, JPREFIX_ACK, JPREFIX_DELIVER, MSG_ID_BYTES, SEG_KIND_MASK, SEG_PUB_BIT,
    SEG_REL_ONLY_PREFIX, SIZE_BYTES,
};
use crate::journal::JOURNAL_FILENAME;
use crate::layout::{all_queue_directory_names, queues_dir};
use crate::segment::SEGMENT_EXTENSION;

pub const CURRENT_FORMAT_VERSION: u32 = 5;
pub const VERSION_FILENAME: &str = "format_version";
const UPGRADE_EXTENSION: &str = "upgrade";

/// `(output, consumed)` per record, or `None` to stop and truncate the
/// remaining (unparseable) tail.
type TransformFn = fn(&[u8]) -> Option<(Vec<u8>, usize)>;

struct Upgrader {
    name: &'static str,
    /// Version this upgrader reads; it writes `from_version + 1`.
    from_version: u32,
    journal: Option<TransformFn>,
    segment: Option<TransformFn>,
}

const UPGRADERS: &[Upgrader] = &[
    Upgrader {
        name: "add_queue_ttl",
        from_version: 1,
        journal: Some(add_queue_ttl_journal),
        segment: Some(add_queue_ttl_segment),
    },
    Upgrader {
        name: "avoid_zeroes",
        from_version: 2,
        journal: None,
        segment: Some(avoid_zeroes_segment),
    },
    Upgrader {
        name: "store_msg_size",
        from_version: 3,
        journal: Some(store_msg_size_journal),
        segment: Some(store_msg_size_segment),
    },
    Upgrader {
        name: "store_msg",
        from_version: 4,
        journal: Some(store_msg_journal),
        segment: Some(store_msg_segment),
    },
];

/// Bring every queue index file under a broker data directory up to
/// the current format. Safe to call on every boot; the version marker
/// makes completed upgrades a no-op.
pub fn upgrade(data_dir: &Path) -> Result<()> {
    let queues = queues_dir(data_dir);
    let version = read_version(&queues)?;
    if version < CURRENT_FORMAT_VERSION {
        for upgrader in UPGRADERS.iter().filter(|u| u.from_version >= version) {
            info!(
                "upgrading queue index files from format {}: {}",
                upgrader.from_version, upgrader.name
            );
            foreach_queue_index(&queues, upgrader)?;
        }
    }
    write_version(&queues, CURRENT_FORMAT_VERSION)
}

/// The on-disk format version. An unmarked tree that already holds
/// queue directories predates the marker and is read as the oldest
/// upgradable format; an unmarked empty tree is already current.
fn read_version(queues: &Path) -> Result<u32> {
    let path = queues.join(VERSION_FILENAME);
    match fs::read_to_string(&path) {
        Ok(text) => text
            .trim()
            .parse::<u32>()
            .with_context(|| format!("bad version marker {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            if all_queue_directory_names(queues)?.is_empty() {
                Ok(CURRENT_FORMAT_VERSION)
            } else {
                Ok(1)
            }
        }
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

fn write_version(queues: &Path, version: u32) -> Result<()> {
    fs::create_dir_all(queues)?;
    let path = queues.join(VERSION_FILENAME);
    let tmp = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(version.to_string().as_bytes())?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Run one upgrader over every queue directory, fanning the directories
/// out across worker threads. Queues are independent; the first error
/// wins.
fn foreach_queue_index(queues: &Path, upgrader: &Upgrader) -> Result<()> {
    let dir_names = all_queue_directory_names(queues)?;
    if dir_names.is_empty() {
        return Ok(());
    }
    let worker_count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .min(dir_names.len());
    let mut buckets: Vec<Vec<String>> = vec![Vec::new(); worker_count];
    for (i, name) in dir_names.into_iter().enumerate() {
        buckets[i % worker_count].push(name);
    }
    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(worker_count);
        for bucket in buckets {
            handles.push(scope.spawn(move || -> Result<()> {
                for dir_name in bucket {
                    transform_queue(&queues.join(&dir_name), upgrader)
                        .with_context(|| format!("upgrading queue directory {dir_name}"))?;
                }
                Ok(())
            }));
        }
        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("upgrade worker panicked"))??;
        }
        Ok(())
    })
}

fn transform_queue(queue_dir: &Path, upgrader: &Upgrader) -> Result<()> {
    if let Some(journal_fn) = upgrader.journal {
        transform_file(&queue_dir.join(JOURNAL_FILENAME), journal_fn)?;
    }
    if let Some(segment_fn) = upgrader.segment {
        for entry in fs::read_dir(queue_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(SEGMENT_EXTENSION) {
                transform_file(&path, segment_fn)?;
            }
        }
    }
    Ok(())
}

/// Rewrite one file through a transform, record by record, then rename
/// the result over the original. Missing and zero-length files are left
/// alone.
fn transform_file(path: &Path, transform: TransformFn) -> Result<()> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    if content.is_empty() {
        return Ok(());
    }
    let mut output = Vec::with_capacity(content.len());
    let mut rest: &[u8] = &content;
    while let Some((chunk, consumed)) = transform(rest) {
        output.extend_from_slice(&chunk);
        rest = &rest[consumed..];
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".");
    tmp.push(UPGRADE_EXTENSION);
    let tmp = std::path::PathBuf::from(tmp);
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(&output)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

fn journal_kind(bytes: &[u8]) -> Option<u8> {
    if bytes.len() < 8 {
        return None;
    }
    Some(bytes[0] >> 6)
}

fn segment_header(bytes: &[u8]) -> Option<u16> {
    if bytes.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

// v1 -> v2: insert the expiry field (default 0, "no expiry") after the
// msg-id of every publish record.

fn add_queue_ttl_journal(bytes: &[u8]) -> Option<(Vec<u8>, usize)> {
    match journal_kind(bytes)? {
        JPREFIX_DELIVER | JPREFIX_ACK => Some((bytes[..8].to_vec(), 8)),
        _ => {
            let end = 8 + MSG_ID_BYTES;
            if bytes.len() < end {
                return None;
            }
            let mut out = bytes[..end].to_vec();
            out.extend_from_slice(&[0u8; EXPIRY_BYTES]);
            Some((out, end))
        }
    }
}

fn add_queue_ttl_segment(bytes: &[u8]) -> Option<(Vec<u8>, usize)> {
    let header = segment_header(bytes)?;
    if header & SEG_PUB_BIT != 0 {
        let end = 2 + MSG_ID_BYTES;
        if bytes.len() < end {
            return None;
        }
        let mut out = bytes[..end].to_vec();
        out.extend_from_slice(&[0u8; EXPIRY_BYTES]);
        Some((out, end))
    } else if header & SEG_KIND_MASK == SEG_REL_ONLY_PREFIX {
        Some((bytes[..2].to_vec(), 2))
    } else {
        None
    }
}

// v2 -> v3: segment files stop carrying zero padding; records pass
// through unchanged and the copy simply ends at the padding.

fn avoid_zeroes_segment(bytes: &[u8]) -> Option<(Vec<u8>, usize)> {
    let header = segment_header(bytes)?;
    if header & SEG_PUB_BIT != 0 {
        let end = 2 + MSG_ID_BYTES + EXPIRY_BYTES;
        if bytes.len() < end {
            return None;
        }
        Some((bytes[..end].to_vec(), end))
    } else if header & SEG_KIND_MASK == SEG_REL_ONLY_PREFIX {
        Some((bytes[..2].to_vec(), 2))
    } else {
        None
    }
}

// v3 -> v4: insert the size field (default 0) after the expiry.

fn store_msg_size_journal(bytes: &[u8]) -> Option<(Vec<u8>, usize)> {
    match journal_kind(bytes)? {
        JPREFIX_DELIVER | JPREFIX_ACK => Some((bytes[..8].to_vec(), 8)),
        _ => {
            let end = 8 + MSG_ID_BYTES + EXPIRY_BYTES;
            if bytes.len() < end {
                return None;
            }
            let mut out = bytes[..end].to_vec();
            out.extend_from_slice(&[0u8; SIZE_BYTES]);
            Some((out, end))
        }
    }
}

fn store_msg_size_segment(bytes: &[u8]) -> Option<(Vec<u8>, usize)> {
    let header = segment_header(bytes)?;
    if header & SEG_PUB_BIT != 0 {
        let end = 2 + MSG_ID_BYTES + EXPIRY_BYTES;
        if bytes.len() < end {
            return None;
        }
        let mut out = bytes[..end].to_vec();
        out.extend_from_slice(&[0u8; SIZE_BYTES]);
        Some((out, end))
    } else if header & SEG_KIND_MASK == SEG_REL_ONLY_PREFIX {
        Some((bytes[..2].to_vec(), 2))
    } else {
        None
    }
}

// v4 -> v5: append the embedded-size field (default 0, "body lives in
// the message store") to every publish record.

fn store_msg_journal(bytes: &[u8]) -> Option<(Vec<u8>, usize)> {
    match journal_kind(bytes)? {
        JPREFIX_DELIVER | JPREFIX_ACK => Some((bytes[..8].to_vec(), 8)),
        _ => {
            let end = 8 + MSG_ID_BYTES + EXPIRY_BYTES + SIZE_BYTES;
            if bytes.len() < end {
                return None;
            }
            let mut out = bytes[..end].to_vec();
            out.extend_from_slice(&0u32.to_be_bytes());
            Some((out, end))
        }
    }
}

fn store_msg_segment(bytes: &[u8]) -> Option<(Vec<u8>, usize)> {
    let header = segment_header(bytes)?;
    if header & SEG_PUB_BIT != 0 {
        let end = 2 + MSG_ID_BYTES + EXPIRY_BYTES + SIZE_BYTES;
        if bytes.len() < end {
            return None;
        }
        let mut out = bytes[..end].to_vec();
        out.extend_from_slice(&0u32.to_be_bytes());
        Some((out, end))
    } else if header & SEG_KIND_MASK == SEG_REL_ONLY_PREFIX {
        Some((bytes[..2].to_vec(), 2))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_journal_inserts_expiry() {
        // v1 publish: word + msg-id.
        let mut old = vec![0u8; 8];
        old[7] = 9; // seq 9, persistent-publish prefix 00
        old.extend_from_slice(&[0xab; 16]);
        let (out, consumed) = add_queue_ttl_journal(&old).expect("transform");
        assert_eq!(consumed, 24);
        assert_eq!(out.len(), 32);
        assert_eq!(&out[..24], &old[..]);
        assert_eq!(&out[24..], &[0u8; 8]);
    }

    #[test]
    fn ttl_journal_passes_deliver_and_ack() {
        let mut bytes = Vec::new();
        crate::codec::encode_journal_deliver(&mut bytes, 3);
        crate::codec::encode_journal_ack(&mut bytes, 3);
        let (out, consumed) = add_queue_ttl_journal(&bytes).expect("transform");
        assert_eq!((out.as_slice(), consumed), (&bytes[..8], 8));
        let (out, consumed) = add_queue_ttl_journal(&bytes[8..]).expect("transform");
        assert_eq!((out.as_slice(), consumed), (&bytes[8..], 8));
    }

    #[test]
    fn avoid_zeroes_strips_padding() {
        // v2/v3 segment publish: header + msg-id + expiry.
        let mut old = Vec::new();
        old.extend_from_slice(&(SEG_PUB_BIT | SEG_REL_ONLY_PREFIX | 5).to_be_bytes());
        old.extend_from_slice(&[0xcd; 16]);
        old.extend_from_slice(&7u64.to_be_bytes());
        let record_len = old.len();
        old.extend_from_slice(&[0u8; 32]); // padding tail

        let mut rest: &[u8] = &old;
        let mut out = Vec::new();
        while let Some((chunk, consumed)) = avoid_zeroes_segment(rest) {
            out.extend_from_slice(&chunk);
            rest = &rest[consumed..];
        }
        assert_eq!(out, old[..record_len].to_vec());
    }

    #[test]
    fn store_msg_appends_embedded_size() {
        // v4 segment publish: header + msg-id + expiry + size.
        let mut old = Vec::new();
        old.extend_from_slice(&(SEG_PUB_BIT | 1).to_be_bytes());
        old.extend_from_slice(&[0x11; 16]);
        old.extend_from_slice(&0u64.to_be_bytes());
        old.extend_from_slice(&256u32.to_be_bytes());
        let (out, consumed) = store_msg_segment(&old).expect("transform");
        assert_eq!(consumed, old.len());
        assert_eq!(out.len(), old.len() + 4);
        assert_eq!(&out[out.len() - 4..], &[0u8; 4]);
    }

    #[test]
    fn truncated_tail_stops() {
        let old = [0x80u8, 0x01, 0xff]; // publish header, body cut short
        assert!(add_queue_ttl_segment(&old).is_none());
        assert!(store_msg_size_segment(&old).is_none());
    }
}
