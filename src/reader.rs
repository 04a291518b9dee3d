//! Offline frame sources: archived telemetry files and test-bench dumps.

use std::fs;
use std::path::Path;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::frame::{Frame, BIOLAB_SYNC};

/// Transport sync prefix preceding each archived packet.
const ARCHIVE_SYNC: [u8; 4] = [0x13, 0x00, 0x57, 0x30];

/// The BIOLAB frame starts 28 bytes after the sync prefix (a 24-byte
/// transport preamble follows the 4 sync bytes).
const ARCHIVE_FRAME_OFFSET: usize = 28;

/// Scans a byte buffer of archived telemetry for BIOLAB frames.
///
/// At each sync hit the candidate frame offset is probed for the BIOLAB
/// sync byte; accepted frames advance the scan past their end, anything
/// else advances by one byte. Truncated trailing data is not an error.
pub fn scan_archive(data: &[u8]) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut pointer = 0;

    while let Some(hit) = find_sync(data, pointer) {
        let frame_start = hit + ARCHIVE_FRAME_OFFSET;
        if frame_start >= data.len() {
            debug!("unexpected end of archive data");
            break;
        }

        if data[frame_start] != BIOLAB_SYNC {
            pointer = hit + 1;
            continue;
        }

        let length = match data.get(frame_start + 1) {
            Some(byte) => usize::from(*byte) * 2 + 4,
            None => {
                debug!("unexpected end of archive data");
                break;
            }
        };
        let end = (frame_start + length).min(data.len());

        let frame = Frame::new(Utc::now(), Utc::now(), data[frame_start..end].to_vec());
        if frame.in_spec() {
            frames.push(frame);
        }
        pointer = frame_start + length;
    }

    debug!("archive data contained {} BIOLAB frames", frames.len());
    frames
}

fn find_sync(data: &[u8], from: usize) -> Option<usize> {
    if from >= data.len() {
        return None;
    }
    data[from..]
        .windows(ARCHIVE_SYNC.len())
        .position(|window| window == ARCHIVE_SYNC)
        .map(|at| from + at)
}

/// Reads an archived telemetry file.
pub fn read_archive_file(path: &Path) -> std::io::Result<Vec<Frame>> {
    debug!("processing archive file {}", path.display());
    let data = fs::read(path)?;
    Ok(scan_archive(&data))
}

/// Reads a test-bench dump: one frame per line, whitespace-separated
/// decimal byte values closed by a trailing token.
pub fn read_test_bench_file(path: &Path) -> std::io::Result<Vec<Frame>> {
    debug!("processing test bench file {}", path.display());
    let text = fs::read_to_string(path)?;

    let mut frames = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((_, bytes)) = tokens.split_last() else {
            continue;
        };

        let data: Option<Vec<u8>> = bytes.iter().map(|token| token.parse().ok()).collect();
        let Some(data) = data else {
            warn!("test bench line {} is not a decimal byte list", number + 1);
            continue;
        };

        let frame = Frame::new(Utc::now(), Utc::now(), data);
        if frame.in_spec() {
            frames.push(frame);
        }
    }

    info!("test bench file contained {} frames", frames.len());
    Ok(frames)
}
