//! Image reassembly aggregates.
//!
//! An [`Image`](Image) collects the data fragments downlinked for one
//! (EC address, memory slot, time tag) acquisition. Fragments arrive in
//! socket order, may repeat on retransmit, and may be lost for good;
//! reconstruction fills the holes so operators always get a file to
//! look at.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::frame::{CameraType, Frame, FRAME_LEN, TM_FLIR_INIT, TM_UCAM_INIT};

/// Payload bytes carried by one FLIR data fragment.
pub const FLIR_FRAGMENT_LEN: usize = FRAME_LEN - 94;

/// Default payload length of a uCAM data fragment, used to fill holes.
pub const UCAM_FRAGMENT_LEN: usize = 158;

/// Quantisation and Huffman tables of the uCAM JPEG header. When
/// fragment 0 is lost the onboard tables never change, so a usable
/// image can still be produced by forging this prelude.
#[rustfmt::skip]
pub const UCAM_JPEG_PRELUDE: [u8; 158] = [
    0xff, 0xd8, 0xff, 0xdb, 0x00, 0x84, 0x00, 0x0d, 0x09, 0x09, 0x0b, 0x0a,
    0x08, 0x0d, 0x0b, 0x0a, 0x0b, 0x0e, 0x0e, 0x0d, 0x0f, 0x13, 0x20, 0x15,
    0x13, 0x12, 0x12, 0x13, 0x27, 0x1c, 0x1e, 0x17, 0x20, 0x2e, 0x29, 0x31,
    0x30, 0x2e, 0x29, 0x2d, 0x2c, 0x33, 0x3a, 0x4a, 0x3e, 0x33, 0x36, 0x46,
    0x37, 0x2c, 0x2d, 0x40, 0x57, 0x41, 0x46, 0x4c, 0x4e, 0x52, 0x53, 0x52,
    0x32, 0x3e, 0x5a, 0x61, 0x5a, 0x50, 0x60, 0x4a, 0x51, 0x52, 0x4f, 0x01,
    0x0e, 0x0e, 0x0e, 0x13, 0x11, 0x13, 0x26, 0x15, 0x15, 0x26, 0x4f, 0x35,
    0x2d, 0x35, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f,
    0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f,
    0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f,
    0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f,
    0x4f, 0x4f, 0x4f, 0x4f, 0xff, 0xc4, 0x01, 0xa2, 0x00, 0x00, 0x01, 0x05,
    0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00,
];

/// A single image being reassembled from data fragments.
#[derive(Debug)]
pub struct Image {
    /// Stable random identity, also the catalog primary key.
    pub uuid: Uuid,
    pub camera: CameraType,
    pub ec_address: u8,
    /// Human-readable EC position label, `?` when unconfigured.
    pub ec_position: String,
    pub memory_slot: u8,
    /// Fragment count declared by the init frame.
    pub expected_fragments: u16,
    /// Times of the init frame.
    pub acquisition_time: DateTime<Utc>,
    pub ccsds_time: DateTime<Utc>,
    pub time_tag: u32,
    pub name: String,

    fragments: BTreeMap<u16, Frame>,

    /// The onboard memory slot was reused before this image completed.
    pub overwritten: bool,
    /// The image aged past the configured timeout.
    pub outdated: bool,
    /// A transmission sequence touching this image is still running.
    pub transmission_active: bool,
    /// Fragments arrived since the last successful save.
    pub update_pending: bool,

    pub latest_image_file: Option<PathBuf>,
    pub latest_tm_file: Option<PathBuf>,
    pub latest_data_file: Option<PathBuf>,
}

impl Image {
    /// Opens a new image from an init frame. Returns `None` when the
    /// frame's generic TM id is not an init id.
    pub fn from_init(frame: &Frame, ec_position: &str) -> Option<Image> {
        let camera = match frame.generic_tm_id {
            TM_FLIR_INIT => CameraType::Flir,
            TM_UCAM_INIT => CameraType::Ucam,
            _ => {
                debug!(
                    "opening an image with the wrong generic TM id: {:#06x}",
                    frame.generic_tm_id
                );
                return None;
            }
        };

        let name = format!(
            "EC_{}_{}_{}_m{}_{}",
            frame.ec_address,
            camera.label(),
            frame.ccsds_time.format("%H%M%S"),
            frame.memory_slot,
            frame.time_tag
        );

        Some(Image {
            uuid: Uuid::new_v4(),
            camera,
            ec_address: frame.ec_address,
            ec_position: ec_position.to_string(),
            memory_slot: frame.memory_slot,
            expected_fragments: frame.expected_fragments.unwrap_or(0),
            acquisition_time: frame.acquisition_time,
            ccsds_time: frame.ccsds_time,
            time_tag: frame.time_tag,
            name,
            fragments: BTreeMap::new(),
            overwritten: false,
            outdated: false,
            transmission_active: true,
            update_pending: true,
            latest_image_file: None,
            latest_tm_file: None,
            latest_data_file: None,
        })
    }

    /// Accepts a data fragment. A repeated fragment id keeps the later
    /// arrival, which is likely a retransmit; payloads that differ from
    /// byte 90 onward are flagged, differing headers are legitimate.
    pub fn add_fragment(&mut self, frame: Frame) {
        if !frame.in_spec() {
            return;
        }

        let id = frame.fragment_id;
        if id >= self.expected_fragments {
            warn!(
                "{} - unexpected fragment id {} ({} fragments declared)",
                self.name, id, self.expected_fragments
            );
        }

        if let Some(previous) = self.fragments.get(&id) {
            warn!(
                "duplicates found: {} and {}, keeping the later arrival",
                previous.name(),
                frame.name()
            );
            if previous.raw().get(90..) != frame.raw().get(90..) {
                error!("duplicate fragment {} data is not identical", id);
                debug!("duplicate #1 {}", previous);
                debug!("duplicate #2 {}", frame);
            }
        }
        self.fragments.insert(id, frame);
    }

    /// Number of distinct fragments received so far.
    pub fn received_fragments(&self) -> usize {
        self.fragments.len()
    }

    /// Fragments in id order.
    pub fn fragments(&self) -> impl Iterator<Item = &Frame> {
        self.fragments.values()
    }

    /// Fragment ids that would hold up completion. Corrupted fragments
    /// count as missing unless `tolerate_corrupted` is set.
    pub fn missing_fragments(&self, tolerate_corrupted: bool) -> Vec<u16> {
        (0..self.expected_fragments)
            .filter(|id| match self.fragments.get(id) {
                Some(frame) => !tolerate_corrupted && !frame.is_good_image_frame(),
                None => true,
            })
            .collect()
    }

    /// An image is complete once every declared fragment is present
    /// with good integrity.
    pub fn is_complete(&self) -> bool {
        if self.fragments.len() < usize::from(self.expected_fragments) {
            debug!(
                "{} is incomplete: {}/{}",
                self.name,
                self.fragments.len(),
                self.expected_fragments
            );
            return false;
        }
        self.missing_fragments(false).is_empty()
    }

    /// Completion percentage, rounded down.
    pub fn completeness_percent(&self) -> u8 {
        if self.expected_fragments == 0 {
            return 100;
        }
        let present = u32::from(self.expected_fragments) - self.missing_fragments(false).len() as u32;
        (present * 100 / u32::from(self.expected_fragments)) as u8
    }

    /// Materialises the reconstructed byte stream, substituting filler
    /// for missing or corrupted fragments.
    ///
    /// uCAM holes become 158 zero bytes, except fragment 0 whose JPEG
    /// prelude can be forged. FLIR holes become 160 zero bytes so the
    /// thermal matrix keeps its shape.
    pub fn reconstruct(&self) -> Vec<u8> {
        let mut data = Vec::new();

        for id in 0..self.expected_fragments {
            let fragment = self
                .fragments
                .get(&id)
                .filter(|frame| frame.is_good_image_frame());

            match (self.camera, fragment) {
                (CameraType::Ucam, Some(frame)) => {
                    let size = usize::from(frame.payload_size.unwrap_or(0));
                    let end = (94 + size).min(frame.raw().len());
                    data.extend_from_slice(&frame.raw()[94..end]);
                }
                (CameraType::Ucam, None) if id == 0 => {
                    data.extend_from_slice(&UCAM_JPEG_PRELUDE);
                }
                (CameraType::Ucam, None) => {
                    data.extend_from_slice(&[0u8; UCAM_FRAGMENT_LEN]);
                }
                (CameraType::Flir, Some(frame)) => {
                    data.extend_from_slice(&frame.raw()[94..]);
                }
                (CameraType::Flir, None) => {
                    data.extend_from_slice(&[0u8; FLIR_FRAGMENT_LEN]);
                }
            }
        }

        data
    }

    /// Panel status cell for this image.
    pub fn status_label(&self) -> &'static str {
        if self.overwritten {
            "Overwritten"
        } else if self.outdated {
            "Outdated"
        } else if self.is_complete() {
            "Finished"
        } else if self.transmission_active {
            "In progress"
        } else {
            "Incomplete"
        }
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let missing = self.missing_fragments(false);
        write!(
            f,
            "WAPS image {}: {} on EC {} ({}), slot {}, {}/{} fragments ({}%)",
            self.name,
            self.camera,
            self.ec_address,
            self.ec_position,
            self.memory_slot,
            usize::from(self.expected_fragments) - missing.len(),
            self.expected_fragments,
            self.completeness_percent()
        )?;
        if !missing.is_empty() {
            write!(f, ", missing {}", sequence_printout(&missing))?;
        }
        if self.overwritten {
            write!(f, ", overwritten")?;
        }
        if self.outdated {
            write!(f, ", outdated")?;
        }
        Ok(())
    }
}

/// Renders a sorted id list as compact ranges, `[0-5, 7, 9-12]`.
pub fn sequence_printout(ids: &[u16]) -> String {
    let mut runs: Vec<String> = Vec::new();
    let mut iter = ids.iter().copied().peekable();

    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end = iter.next().unwrap();
        }
        if start == end {
            runs.push(start.to_string());
        } else {
            runs.push(format!("{}-{}", start, end));
        }
    }

    format!("[{}]", runs.join(", "))
}
