//! CCSDS packet stream decoding.
//!
//! The downlink multiplexes BIOLAB TM frames into CCSDS space packets:
//! a 6-byte primary header, a 10-byte secondary header carrying the
//! packet timestamp, and an opaque body. When the body hosts a BIOLAB
//! frame, the sync byte `0x40` sits at offset 40 from the packet start.

use std::io::{ErrorKind, Read};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::frame::{Frame, BIOLAB_SYNC, FRAME_LEN};

/// Length of the CCSDS primary header.
pub const CCSDS_PRIMARY_LEN: usize = 6;
/// Length of the CCSDS secondary header.
pub const CCSDS_SECONDARY_LEN: usize = 10;
/// Combined header length read in one piece.
pub const CCSDS_HEADERS_LEN: usize = CCSDS_PRIMARY_LEN + CCSDS_SECONDARY_LEN;

/// Offset of the BIOLAB sync byte from the CCSDS packet start.
pub const BIOLAB_OFFSET: usize = 40;

/// Epoch of the CCSDS coarse time field, 1980-01-06 UTC.
pub fn ccsds_epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(315_964_800, 0).expect("CCSDS epoch is representable")
}

/// Errors raised while pulling packets off the byte stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("I/O error on the telemetry stream: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended cleanly between packets.
    #[error("end of stream")]
    Eof,

    /// The stream ended inside a packet, or the peer stopped sending
    /// before the declared packet length was satisfied.
    #[error("short read inside a CCSDS packet: {got} of {expected} bytes")]
    ShortRead { expected: usize, got: usize },
}

/// One CCSDS space packet, headers included.
#[derive(Debug, Clone)]
pub struct CcsdsPacket {
    /// Timestamp from the secondary header: coarse seconds plus
    /// `fine / 256` fractional seconds past the 1980-01-06 epoch.
    pub ccsds_time: DateTime<Utc>,
    pub apid: u16,
    pub sequence_count: u16,
    /// The raw packet-length field (total length minus 7).
    pub packet_length: u16,
    data: Vec<u8>,
}

impl CcsdsPacket {
    /// The full packet bytes, headers first.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Parses CCSDS packets off a byte stream.
pub struct CcsdsDecoder<R>
where
    R: Read,
{
    reader: R,
}

impl<R> CcsdsDecoder<R>
where
    R: Read,
{
    pub fn new(reader: R) -> CcsdsDecoder<R> {
        CcsdsDecoder { reader }
    }

    /// Returns a reference to the underlying [`Read`](Read).
    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    /// Returns a mutable reference to the underlying [`Read`](Read).
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Reads the next CCSDS packet. Blocks until a whole packet is
    /// available or the underlying reader fails.
    pub fn next_packet(&mut self) -> Result<CcsdsPacket, StreamError> {
        let mut header = [0u8; CCSDS_HEADERS_LEN];
        match self.fill(&mut header)? {
            0 => return Err(StreamError::Eof),
            n if n < CCSDS_HEADERS_LEN => {
                return Err(StreamError::ShortRead {
                    expected: CCSDS_HEADERS_LEN,
                    got: n,
                })
            }
            _ => {}
        }

        let packet_length = u16::from_be_bytes([header[4], header[5]]);
        let body_len = (usize::from(packet_length) + 1).saturating_sub(CCSDS_SECONDARY_LEN);
        let mut body = vec![0u8; body_len];
        let got = self.fill(&mut body)?;
        if got < body_len {
            return Err(StreamError::ShortRead {
                expected: body_len,
                got,
            });
        }

        let word1 = u16::from_be_bytes([header[0], header[1]]);
        let word2 = u16::from_be_bytes([header[2], header[3]]);
        let apid = word1 & 0x03FF;
        let sequence_count = word2 & 0x3FFF;

        let coarse = u32::from_be_bytes([header[6], header[7], header[8], header[9]]);
        let word3 = u16::from_be_bytes([header[10], header[11]]);
        let fine_ms = u32::from((word3 >> 8) & 0x00FF) * 1000 / 256;
        let ccsds_time = ccsds_epoch()
            + Duration::seconds(i64::from(coarse))
            + Duration::milliseconds(i64::from(fine_ms));

        let packet_id = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
        debug!(
            "CCSDS packet: type {}, APID {}, seq {}, length {}, element id {}, packet id {}, time {} (coarse {} fine {} ms)",
            (word1 >> 12) & 1,
            apid,
            sequence_count,
            packet_length,
            (packet_id >> 27) & 0x0F,
            packet_id & 0x07FF_FFFF,
            ccsds_time,
            coarse,
            fine_ms
        );

        let mut data = header.to_vec();
        data.extend_from_slice(&body);
        Ok(CcsdsPacket {
            ccsds_time,
            apid,
            sequence_count,
            packet_length,
            data,
        })
    }

    /// Reads the next packet and extracts its BIOLAB frame, if it has
    /// one. `Ok(None)` means the packet carried no image-bearing frame.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, StreamError> {
        let packet = self.next_packet()?;
        Ok(extract_frame(&packet, Utc::now()))
    }

    /// Fills `buf` as far as the stream allows, returning the number of
    /// bytes read. Interrupted reads are retried; a zero return from the
    /// reader ends the fill.
    fn fill(&mut self, mut buf: &mut [u8]) -> Result<usize, StreamError> {
        let mut total = 0;
        while !buf.is_empty() {
            match self.reader.read(buf) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    buf = &mut buf[n..];
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }
}

/// Locates and extracts the BIOLAB frame of a CCSDS packet. Packets
/// shorter than 42 bytes or without the sync byte at offset 40 are
/// discarded with a debug trace; out-of-spec frames are dropped too.
pub fn extract_frame(packet: &CcsdsPacket, acquisition_time: DateTime<Utc>) -> Option<Frame> {
    let data = packet.data();
    if data.len() < BIOLAB_OFFSET + 2 || data[BIOLAB_OFFSET] != BIOLAB_SYNC {
        debug!("not a BIOLAB TM packet ({} bytes)", data.len());
        return None;
    }

    let declared = usize::from(data[BIOLAB_OFFSET + 1]) * 2 + 4;
    if declared != FRAME_LEN {
        warn!("unexpected BIOLAB frame length: {}", declared);
    }

    let end = (BIOLAB_OFFSET + declared).min(data.len());
    let frame = Frame::new(
        packet.ccsds_time,
        acquisition_time,
        data[BIOLAB_OFFSET..end].to_vec(),
    );
    if frame.in_spec() {
        Some(frame)
    } else {
        None
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Wraps a BIOLAB frame into a CCSDS packet with the given coarse
    /// and fine time fields.
    pub fn ccsds_wrap(frame_data: &[u8], coarse: u32, fine: u8) -> Vec<u8> {
        // 24 filler bytes between the headers and the frame put the
        // sync byte at offset 40.
        let body_len = 24 + frame_data.len();
        let total = CCSDS_HEADERS_LEN + body_len;
        let mut data = vec![0u8; total];
        let length_field = (total - CCSDS_PRIMARY_LEN - 1) as u16;
        data[4..6].copy_from_slice(&length_field.to_be_bytes());
        data[6..10].copy_from_slice(&coarse.to_be_bytes());
        data[10] = fine;
        data[BIOLAB_OFFSET..BIOLAB_OFFSET + frame_data.len()].copy_from_slice(frame_data);
        data
    }
}
