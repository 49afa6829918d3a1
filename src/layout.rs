//! On-disk layout conventions.
//!
//! Every queue owns one directory under the broker's `queues` tree,
//! named by the lowercase base-36 rendering of the MD5 of the queue
//! name. Inside it live `journal.jif` and the `<seg>.idx` files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const QUEUES_DIR: &str = "queues";

/// The fixed `queues` subdirectory of a broker data directory.
pub fn queues_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(QUEUES_DIR)
}

/// Directory name for a queue: lowercase base-36 of the MD5 of its
/// canonical name.
pub fn queue_dir_name(queue_name: &str) -> String {
    let digest = md5::compute(queue_name.as_bytes());
    to_base36(u128::from_be_bytes(digest.0))
}

pub fn queue_dir(queues_dir: &Path, queue_name: &str) -> PathBuf {
    queues_dir.join(queue_dir_name(queue_name))
}

fn to_base36(mut n: u128) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}

/// Names of all queue directories currently on disk. Non-directories
/// (the recovery-terms file, the format-version marker) are skipped.
pub fn all_queue_directory_names(queues_dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    if !queues_dir.exists() {
        return Ok(names);
    }
    for entry in fs::read_dir(queues_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort_unstable();
    Ok(names)
}
