//! BIOLAB telemetry frames and the WAPS image packet integrity checks.
//!
//! A BIOLAB TM frame is a fixed 254-byte unit embedded in CCSDS payload
//! telemetry. Byte 0 carries the sync value `0x40`, byte 1 the encoded
//! length (`*2 + 4`), byte 2 the EC address, bytes 4..8 a big-endian
//! time tag. The generic TM selector at bytes 84..90 identifies WAPS
//! image traffic; image-specific fields follow from byte 90.

use std::cell::Cell;
use std::fmt;

use chrono::{DateTime, Utc};
use crc::Crc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Fixed length of a BIOLAB TM frame.
pub const FRAME_LEN: usize = 254;

/// Sync byte opening every BIOLAB TM frame.
pub const BIOLAB_SYNC: u8 = 0x40;

/// Generic TM id of a FLIR image init packet.
pub const TM_FLIR_INIT: u16 = 0x4100;
/// Generic TM id of a FLIR image data packet.
pub const TM_FLIR_DATA: u16 = 0x4200;
/// Generic TM id of a uCAM image init packet.
pub const TM_UCAM_INIT: u16 = 0x5100;
/// Generic TM id of a uCAM image data packet.
pub const TM_UCAM_DATA: u16 = 0x5200;

/// FLIR data packets are protected by CRC-16/XMODEM: truncated
/// polynomial 0x1021, zero initial value, no reflection, no final xor.
const CRC16: Crc<u16> = Crc::<u16>::new(&crc::CRC_16_XMODEM);

/// Reads the big-endian 16-bit word at byte offset `at`.
pub(crate) fn word(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

/// The two cameras hosted by each experiment controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraType {
    /// Thermal sensor; 80x60 16-bit frames with a 480-byte TM prefix.
    Flir,
    /// Colour sensor; JPEG byte stream.
    Ucam,
}

impl CameraType {
    /// Label used in image names and the catalog.
    pub fn label(&self) -> &'static str {
        match self {
            CameraType::Flir => "FLIR",
            CameraType::Ucam => "uCAM",
        }
    }
}

impl fmt::Display for CameraType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One ingested BIOLAB TM frame, immutable after construction.
///
/// Header fields are extracted eagerly; the expensive integrity check
/// (CRC or verify code) runs on first use and its verdict is cached.
/// The first failed check latches a corruption event which
/// [`take_corruption_event`](Self::take_corruption_event) hands out
/// exactly once, so the receiver-wide corruption counter cannot be
/// bumped twice for the same frame.
#[derive(Debug)]
pub struct Frame {
    /// Stable random identity, also the catalog primary key.
    pub uuid: Uuid,
    /// Wall-clock time the frame was read off its source.
    pub acquisition_time: DateTime<Utc>,
    /// Timestamp of the enclosing CCSDS packet (ground time for file
    /// sources).
    pub ccsds_time: DateTime<Utc>,
    data: Vec<u8>,

    /// EC address, byte 2.
    pub ec_address: u8,
    /// Onboard acquisition counter, bytes 4..8 big-endian.
    pub time_tag: u32,
    /// Generic TM id, bytes 84..86.
    pub generic_tm_id: u16,
    /// Generic TM type, bytes 86..88.
    pub generic_tm_type: u16,
    /// Generic TM data length, bytes 88..90.
    pub generic_tm_length: u16,
    /// Image memory slot, high nibble of the generic TM type.
    pub memory_slot: u8,
    /// Fragment id, low ten bits of the generic TM type.
    pub fragment_id: u16,
    /// Memory slot the EC reports as currently written, used for
    /// overwrite detection (high nibble of bytes 56..58).
    pub biolab_current_slot: u8,

    /// Total fragment count, init packets only.
    pub expected_fragments: Option<u16>,
    /// Fragment id repeated in the data section (FLIR: upper four bits
    /// reserved and masked off).
    pub data_fragment_id: Option<u16>,
    /// Declared CRC, FLIR data packets only.
    pub declared_crc: Option<u16>,
    /// Payload size, uCAM data packets only.
    pub payload_size: Option<u16>,
    /// Declared verify code, uCAM data packets only.
    pub declared_verify_code: Option<u16>,

    verdict: Cell<Option<bool>>,
    corruption_pending: Cell<bool>,
}

impl Frame {
    /// Builds a frame from raw bytes and the timestamps of its source.
    pub fn new(ccsds_time: DateTime<Utc>, acquisition_time: DateTime<Utc>, data: Vec<u8>) -> Self {
        let mut frame = Frame {
            uuid: Uuid::new_v4(),
            acquisition_time,
            ccsds_time,
            data,
            ec_address: 0,
            time_tag: 0,
            generic_tm_id: 0,
            generic_tm_type: 0,
            generic_tm_length: 0,
            memory_slot: 0,
            fragment_id: 0,
            biolab_current_slot: 0,
            expected_fragments: None,
            data_fragment_id: None,
            declared_crc: None,
            payload_size: None,
            declared_verify_code: None,
            verdict: Cell::new(None),
            corruption_pending: Cell::new(false),
        };
        frame.parse_fields();
        frame
    }

    fn parse_fields(&mut self) {
        if self.data.len() < FRAME_LEN {
            warn!(
                "{} - unexpected end of frame data ({} bytes)",
                self.name(),
                self.data.len()
            );
            return;
        }

        self.ec_address = self.data[2];
        self.time_tag = u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]]);
        self.generic_tm_id = word(&self.data, 84);
        self.generic_tm_type = word(&self.data, 86);
        self.generic_tm_length = word(&self.data, 88);
        self.memory_slot = (self.generic_tm_type >> 12) as u8;
        self.fragment_id = self.generic_tm_type & 0x3FF;
        self.biolab_current_slot = (word(&self.data, 56) >> 12) as u8;

        match self.generic_tm_id {
            TM_FLIR_INIT | TM_UCAM_INIT => {
                self.expected_fragments = Some(word(&self.data, 90));
            }
            TM_FLIR_DATA => {
                // Upper four bits of the fragment id are reserved.
                self.data_fragment_id = Some(word(&self.data, 90) & 0x0FFF);
                self.declared_crc = Some(word(&self.data, 92));
            }
            TM_UCAM_DATA => {
                self.data_fragment_id = Some(word(&self.data, 90));
                let size = word(&self.data, 92);
                self.payload_size = Some(size);
                let at = 94 + usize::from(size);
                if at + 2 <= self.data.len() {
                    self.declared_verify_code = Some(word(&self.data, at));
                } else {
                    warn!(
                        "{} - declared payload size {} leaves no room for a verify code",
                        self.name(),
                        size
                    );
                }
            }
            _ => {}
        }
    }

    /// Raw frame bytes.
    pub fn raw(&self) -> &[u8] {
        &self.data
    }

    /// Frame designation used in logs and the catalog.
    pub fn name(&self) -> String {
        format!(
            "pkt_ec_{}_m{}_{}_{}",
            self.ec_address,
            self.memory_slot,
            self.acquisition_time.format("%Y%m%d_%H%M%S"),
            self.time_tag
        )
    }

    /// Whether the frame matches the BIOLAB framing rules: sync byte
    /// present and actual length consistent with the encoded length.
    pub fn in_spec(&self) -> bool {
        if self.data.first() != Some(&BIOLAB_SYNC) {
            trace!("{} - BIOLAB sync byte not found", self.name());
            return false;
        }
        let declared = match self.data.get(1) {
            Some(byte) => usize::from(*byte) * 2 + 4,
            None => return false,
        };
        if self.data.len() != declared {
            info!(
                "{} - frame length {} does not match the encoded length {}",
                self.name(),
                self.data.len(),
                declared
            );
            return false;
        }
        true
    }

    /// Whether the generic TM id selects WAPS image traffic.
    pub fn is_image_frame(&self) -> bool {
        matches!(
            self.generic_tm_id,
            TM_FLIR_INIT | TM_FLIR_DATA | TM_UCAM_INIT | TM_UCAM_DATA
        )
    }

    /// Camera addressed by this frame, if it is an image frame.
    pub fn camera(&self) -> Option<CameraType> {
        match self.generic_tm_id {
            TM_FLIR_INIT | TM_FLIR_DATA => Some(CameraType::Flir),
            TM_UCAM_INIT | TM_UCAM_DATA => Some(CameraType::Ucam),
            _ => None,
        }
    }

    /// Full integrity check for a WAPS image frame: framing, id range,
    /// memory slot bounds, and the per-camera check (CRC-16/XMODEM for
    /// FLIR data, byte-sum verify code for uCAM data).
    ///
    /// The verdict is computed once and cached, so repeated calls are
    /// cheap and produce a single log line.
    pub fn is_good_image_frame(&self) -> bool {
        if let Some(verdict) = self.verdict.get() {
            return verdict;
        }
        let verdict = self.check_image_frame();
        self.verdict.set(Some(verdict));
        verdict
    }

    /// Reports a corruption latched by the integrity check. Returns
    /// `true` at most once per frame.
    pub fn take_corruption_event(&self) -> bool {
        self.corruption_pending.replace(false)
    }

    fn check_image_frame(&self) -> bool {
        if self.data.len() != FRAME_LEN {
            error!(
                "{} - incorrect frame length {} (expected {})",
                self.name(),
                self.data.len(),
                FRAME_LEN
            );
            return false;
        }

        if !self.is_image_frame() {
            error!(
                "{} - generic TM id {:#06x} does not select a WAPS image packet",
                self.name(),
                self.generic_tm_id
            );
            return false;
        }

        if self.memory_slot > 7 {
            error!(
                "{} - memory slot out of bounds (0 to 7): {}",
                self.name(),
                self.memory_slot
            );
            return false;
        }

        // The fragment id repeated in the data section is known to lag
        // or lead by one on some EC software versions.
        if let Some(id) = self.data_fragment_id {
            if id != self.fragment_id && id != self.fragment_id + 1 {
                debug!(
                    "{} - inconsistent fragment id: {} vs {}",
                    self.name(),
                    self.fragment_id,
                    id
                );
            }
        }

        match self.generic_tm_id {
            TM_FLIR_DATA => self.check_flir_crc(),
            TM_UCAM_DATA => self.check_ucam_verify_code(),
            _ => true,
        }
    }

    fn check_flir_crc(&self) -> bool {
        let mut message = self.data[90..].to_vec();
        message[0] &= 0x0F; // reserved upper bits of the fragment id
        message[2] = 0;
        message[3] = 0; // the CRC field itself is zero for the computation

        if Some(CRC16.checksum(&message)) != self.declared_crc {
            self.declare_corruption("CRC mismatch");
            return false;
        }
        true
    }

    fn check_ucam_verify_code(&self) -> bool {
        let declared = match self.declared_verify_code {
            Some(code) => code,
            None => {
                self.declare_corruption("verify code missing");
                return false;
            }
        };

        // Sum over the fragment id, size and payload fields, without the
        // trailing verify code itself. The low byte of the sum is stored
        // in the high byte of the big-endian code.
        let end = 90 + 4 + usize::from(self.payload_size.unwrap_or(0));
        let sum: u32 = self.data[90..end].iter().map(|b| u32::from(*b)).sum();
        let computed = ((sum & 0xFF) << 8) as u16;

        if computed != declared {
            self.declare_corruption("verify code mismatch");
            return false;
        }
        true
    }

    fn declare_corruption(&self, what: &str) {
        warn!(
            "{} - {}, fragment {} is likely corrupted",
            self.name(),
            what,
            self.fragment_id
        );
        self.corruption_pending.set(true);
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BIOLAB TM frame {}: EC {}, time tag {}, TM id {:#06x}, type {:#06x}, length {}",
            self.name(),
            self.ec_address,
            self.time_tag,
            self.generic_tm_id,
            self.generic_tm_type,
            self.generic_tm_length
        )?;
        match self.generic_tm_id {
            TM_FLIR_INIT | TM_UCAM_INIT => write!(
                f,
                ", {} init, slot {}, {} fragments",
                self.camera().map(|c| c.label()).unwrap_or("?"),
                self.memory_slot,
                self.expected_fragments.unwrap_or(0)
            ),
            TM_FLIR_DATA => write!(
                f,
                ", FLIR data, slot {}, fragment {}, crc {:#06x}",
                self.memory_slot,
                self.fragment_id,
                self.declared_crc.unwrap_or(0)
            ),
            TM_UCAM_DATA => write!(
                f,
                ", uCAM data, slot {}, fragment {}, size {}, verify code {:#06x}",
                self.memory_slot,
                self.fragment_id,
                self.payload_size.unwrap_or(0),
                self.declared_verify_code.unwrap_or(0)
            ),
            _ => Ok(()),
        }
    }
}
