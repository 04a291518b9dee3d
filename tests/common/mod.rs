//! Frame and stream builders shared by the integration tests.
#![allow(dead_code)]

use crc::Crc;
use waps_ies::frame::{BIOLAB_SYNC, FRAME_LEN, TM_FLIR_DATA, TM_UCAM_DATA};

const CRC16: Crc<u16> = Crc::<u16>::new(&crc::CRC_16_XMODEM);

/// A blank in-spec frame with the generic TM selector filled in.
pub fn base_frame(ec_address: u8, tm_id: u16, slot: u8, fragment: u16) -> Vec<u8> {
    let mut data = vec![0u8; FRAME_LEN];
    data[0] = BIOLAB_SYNC;
    data[1] = 125; // 125 * 2 + 4 = 254
    data[2] = ec_address;
    data[4..8].copy_from_slice(&0x0102_0304u32.to_be_bytes());
    data[56..58].copy_from_slice(&(u16::from(slot) << 12).to_be_bytes());
    data[84..86].copy_from_slice(&tm_id.to_be_bytes());
    let tm_type = (u16::from(slot) << 12) | (fragment & 0x3FF);
    data[86..88].copy_from_slice(&tm_type.to_be_bytes());
    data[88..90].copy_from_slice(&82u16.to_be_bytes());
    data
}

/// An init frame declaring `count` fragments.
pub fn init_frame(ec_address: u8, tm_id: u16, slot: u8, count: u16) -> Vec<u8> {
    let mut data = base_frame(ec_address, tm_id, slot, 0);
    data[90..92].copy_from_slice(&count.to_be_bytes());
    data
}

/// A FLIR data frame with a valid CRC over a patterned payload.
pub fn flir_data_frame(ec_address: u8, slot: u8, fragment: u16) -> Vec<u8> {
    let mut data = base_frame(ec_address, TM_FLIR_DATA, slot, fragment);
    data[90..92].copy_from_slice(&fragment.to_be_bytes());
    for (i, byte) in data[94..].iter_mut().enumerate() {
        *byte = (i as u8).wrapping_mul(7).wrapping_add(fragment as u8);
    }
    let mut message = data[90..].to_vec();
    message[0] &= 0x0F;
    message[2] = 0;
    message[3] = 0;
    let crc = CRC16.checksum(&message);
    data[92..94].copy_from_slice(&crc.to_be_bytes());
    data
}

/// A uCAM data frame carrying `payload` with a valid verify code.
pub fn ucam_data_frame(ec_address: u8, slot: u8, fragment: u16, payload: &[u8]) -> Vec<u8> {
    let mut data = base_frame(ec_address, TM_UCAM_DATA, slot, fragment);
    data[90..92].copy_from_slice(&fragment.to_be_bytes());
    data[92..94].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    data[94..94 + payload.len()].copy_from_slice(payload);
    let sum: u32 = data[90..94 + payload.len()]
        .iter()
        .map(|b| u32::from(*b))
        .sum();
    let code = ((sum & 0xFF) << 8) as u16;
    data[94 + payload.len()..96 + payload.len()].copy_from_slice(&code.to_be_bytes());
    data
}

/// Sets the onboard time tag of a built frame.
pub fn with_time_tag(mut data: Vec<u8>, tag: u32) -> Vec<u8> {
    data[4..8].copy_from_slice(&tag.to_be_bytes());
    data
}

/// Wraps a BIOLAB frame into a CCSDS packet with the given coarse and
/// fine time fields.
pub fn ccsds_wrap(frame_data: &[u8], coarse: u32, fine: u8) -> Vec<u8> {
    let body_len = 24 + frame_data.len();
    let total = 16 + body_len;
    let mut data = vec![0u8; total];
    let length_field = (total - 7) as u16;
    data[4..6].copy_from_slice(&length_field.to_be_bytes());
    data[6..10].copy_from_slice(&coarse.to_be_bytes());
    data[10] = fine;
    data[40..40 + frame_data.len()].copy_from_slice(frame_data);
    data
}

/// Builds a `Frame` value the way the live readers do.
pub fn frame(data: Vec<u8>) -> waps_ies::Frame {
    waps_ies::Frame::new(chrono::Utc::now(), chrono::Utc::now(), data)
}
