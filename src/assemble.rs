//! Frame-to-image assembly.
//!
//! [`ingest`](ingest) applies a batch of BIOLAB frames to the working
//! set of open images: init frames open images, data frames accumulate
//! into them, anything else closes the running transmission sequence.
//! All receiver-wide bookkeeping lives in [`ReceiverState`](ReceiverState),
//! owned by the ingest loop and passed in by reference.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::frame::{CameraType, Frame, TM_FLIR_DATA, TM_FLIR_INIT, TM_UCAM_DATA, TM_UCAM_INIT};
use crate::image::{sequence_printout, Image};
use crate::stream::ccsds_epoch;

/// Receiver-wide counters, reported on shutdown and to the panel.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Counters {
    pub packets_received: u64,
    pub biolab_packets: u64,
    pub waps_image_packets: u64,
    pub initialized_images: u64,
    pub completed_images: u64,
    pub lost_packets: u64,
    pub corrupted_packets: u64,
}

/// Mutable receiver state: counters and the transmission flag. The
/// per-EC slot tracking lives in the [`EcTable`](EcTable).
#[derive(Debug, Clone)]
pub struct ReceiverState {
    pub counters: Counters,
    /// An image transmission sequence is currently running.
    pub transmission_in_progress: bool,
    /// CCSDS time of the most recent packet.
    pub last_ccsds_time: DateTime<Utc>,
}

impl Default for ReceiverState {
    fn default() -> Self {
        ReceiverState {
            counters: Counters::default(),
            transmission_in_progress: false,
            last_ccsds_time: ccsds_epoch(),
        }
    }
}

impl ReceiverState {
    /// One-line status summary logged after processing.
    pub fn status_line(&self) -> String {
        format!(
            "# CCSDS time: {} P:{}:{}:{} M:{}:{} I:{}:{}",
            self.last_ccsds_time.format("%Y/%m/%d %H:%M:%S"),
            self.counters.packets_received,
            self.counters.biolab_packets,
            self.counters.waps_image_packets,
            self.counters.lost_packets,
            self.counters.corrupted_packets,
            self.counters.initialized_images,
            self.counters.completed_images
        )
    }
}

/// Per-EC bookkeeping.
#[derive(Debug, Clone)]
pub struct EcState {
    pub address: u8,
    /// Position label from configuration, `?` when unknown.
    pub position: String,
    /// Display column in the status panel, at most four are handed out.
    pub panel_column: Option<u8>,
    pub transmission_active: bool,
    pub last_memory_slot: Option<u8>,
}

/// Table of every EC seen or configured, in first-contact order.
#[derive(Debug, Default)]
pub struct EcTable {
    entries: Vec<EcState>,
}

/// Number of EC columns the status panel can display.
const PANEL_COLUMNS: u8 = 4;

impl EcTable {
    pub fn new() -> EcTable {
        EcTable::default()
    }

    /// Seeds the table from the configured address/position pairs.
    pub fn seed(pairs: impl IntoIterator<Item = (u8, String)>) -> EcTable {
        let mut table = EcTable::new();
        for (address, position) in pairs {
            table.entry(address).position = position;
        }
        table
    }

    /// Position label for an address, `?` when the EC is unknown.
    pub fn position(&self, address: u8) -> &str {
        self.entries
            .iter()
            .find(|ec| ec.address == address)
            .map(|ec| ec.position.as_str())
            .unwrap_or("?")
    }

    /// The entry for an address, created on first contact. New entries
    /// take the first free panel column.
    pub fn entry(&mut self, address: u8) -> &mut EcState {
        if let Some(at) = self.entries.iter().position(|ec| ec.address == address) {
            return &mut self.entries[at];
        }

        let column = (0..PANEL_COLUMNS).find(|c| {
            self.entries
                .iter()
                .all(|ec| ec.panel_column != Some(*c))
        });
        if column.is_none() {
            warn!("all panel columns are occupied already");
        } else {
            info!(
                "EC address {} occupies panel column {}",
                address,
                column.unwrap()
            );
        }

        self.entries.push(EcState {
            address,
            position: "?".to_string(),
            panel_column: column,
            transmission_active: false,
            last_memory_slot: None,
        });
        self.entries.last_mut().unwrap()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EcState> {
        self.entries.iter()
    }
}

/// Knobs of the assembly step.
#[derive(Debug, Clone)]
pub struct AssemblyOptions {
    /// Age at which an open image is declared outdated. `None` disables
    /// timeouts entirely.
    pub image_timeout: Option<Duration>,
    /// Mark open images overwritten when the payload reports switching
    /// to their memory slot.
    pub detect_slot_change: bool,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        AssemblyOptions {
            image_timeout: Some(Duration::minutes(600)),
            detect_slot_change: false,
        }
    }
}

/// What a batch did to the working set, for the catalog and the logs.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Frame-to-image bindings established by this batch.
    pub bound_frames: Vec<(Uuid, Uuid)>,
    flir_init: BTreeMap<u8, u32>,
    flir_data: BTreeMap<u8, Vec<u16>>,
    ucam_init: BTreeMap<u8, u32>,
    ucam_data: BTreeMap<u8, Vec<u16>>,
    other: BTreeMap<u16, u32>,
}

impl BatchReport {
    fn count_init(&mut self, camera: CameraType, slot: u8) {
        let counts = match camera {
            CameraType::Flir => &mut self.flir_init,
            CameraType::Ucam => &mut self.ucam_init,
        };
        *counts.entry(slot).or_default() += 1;
    }

    fn count_data(&mut self, camera: CameraType, slot: u8, fragment: u16) {
        let counts = match camera {
            CameraType::Flir => &mut self.flir_data,
            CameraType::Ucam => &mut self.ucam_data,
        };
        counts.entry(slot).or_default().push(fragment);
    }

    fn log(&self) {
        let relevant = !self.flir_init.is_empty()
            || !self.flir_data.is_empty()
            || !self.ucam_init.is_empty()
            || !self.ucam_data.is_empty();

        if relevant {
            info!("new WAPS image packets:");
            for (slot, count) in &self.flir_init {
                info!("  FLIR init, memory slot {}, count {}", slot, count);
            }
            for (slot, ids) in &self.flir_data {
                info!(
                    "  FLIR data, memory slot {}, count {}, fragments {}",
                    slot,
                    ids.len(),
                    sequence_printout(ids)
                );
            }
            for (slot, count) in &self.ucam_init {
                info!("  uCAM init, memory slot {}, count {}", slot, count);
            }
            for (slot, ids) in &self.ucam_data {
                info!(
                    "  uCAM data, memory slot {}, count {}, fragments {}",
                    slot,
                    ids.len(),
                    sequence_printout(ids)
                );
            }
        } else {
            debug!("no relevant image packets found");
        }

        if !self.other.is_empty() {
            debug!("other BIOLAB packets:");
            for (tm_id, count) in &self.other {
                debug!("  TM id {:#06x}, count {}", tm_id, count);
            }
        }
    }
}

/// Applies a batch of frames, in arrival order, to the working set.
pub fn ingest(
    frames: Vec<Frame>,
    images: &mut Vec<Image>,
    state: &mut ReceiverState,
    ecs: &mut EcTable,
    options: &AssemblyOptions,
) -> BatchReport {
    let mut report = BatchReport::default();

    for frame in frames {
        if !frame.in_spec() {
            error!("{} is not a BIOLAB TM frame", frame.name());
            continue;
        }

        // Overwrite detection from general telemetry: each EC keeps
        // reporting which of its slots it is writing, so a change dooms
        // any open image still assembling in that slot on that EC.
        if options.detect_slot_change {
            let ec = ecs.entry(frame.ec_address);
            if ec.last_memory_slot != Some(frame.biolab_current_slot) {
                info!(
                    "EC {} active memory slot update: {} (previous {:?})",
                    frame.ec_address, frame.biolab_current_slot, ec.last_memory_slot
                );
                ec.last_memory_slot = Some(frame.biolab_current_slot);
                for image in images.iter_mut() {
                    if image.ec_address == frame.ec_address
                        && image.memory_slot == frame.biolab_current_slot
                    {
                        image.overwritten = true;
                        warn!("incomplete image {} has been overwritten", image.name);
                    }
                }
            }
        }

        match frame.generic_tm_id {
            TM_FLIR_INIT | TM_UCAM_INIT => {
                let camera = frame.camera().expect("init id maps to a camera");
                report.count_init(camera, frame.memory_slot);
                state.counters.waps_image_packets += 1;
                state.counters.initialized_images += 1;
                state.transmission_in_progress = true;

                ecs.entry(frame.ec_address).transmission_active = true;

                if frame.fragment_id != 0 {
                    match camera {
                        CameraType::Flir => warn!(
                            "{} - init fragment id is not zero: {}",
                            frame.name(),
                            frame.fragment_id
                        ),
                        CameraType::Ucam => {
                            error!("{} - init fragment id is not zero", frame.name());
                            continue;
                        }
                    }
                }

                let new_image = match Image::from_init(&frame, ecs.position(frame.ec_address)) {
                    Some(image) => image,
                    None => continue,
                };

                // A repeated init for the same acquisition is a no-op;
                // any other image in this EC's slot just got overwritten.
                let duplicate = images.iter().any(|image| {
                    image.ec_address == new_image.ec_address
                        && image.camera == new_image.camera
                        && image.memory_slot == new_image.memory_slot
                        && image.expected_fragments == new_image.expected_fragments
                        && image.time_tag == new_image.time_tag
                });
                if duplicate {
                    warn!("duplicated image detected ({})", new_image.name);
                    continue;
                }

                for image in images.iter_mut() {
                    if image.ec_address == new_image.ec_address
                        && image.memory_slot == new_image.memory_slot
                        && !image.overwritten
                    {
                        image.overwritten = true;
                        warn!(
                            "previous image in memory slot {} overwritten ({})",
                            image.memory_slot, image.name
                        );
                    }
                }

                info!(
                    "new {} image in memory slot {} with {} expected fragments ({})",
                    camera, new_image.memory_slot, new_image.expected_fragments, new_image.name
                );
                report.bound_frames.push((frame.uuid, new_image.uuid));
                images.push(new_image);
            }

            TM_FLIR_DATA | TM_UCAM_DATA => {
                let camera = frame.camera().expect("data id maps to a camera");
                report.count_data(camera, frame.memory_slot, frame.fragment_id);
                state.counters.waps_image_packets += 1;
                state.transmission_in_progress = true;
                ecs.entry(frame.ec_address);

                let timeout = options.image_timeout;
                let target = images.iter_mut().find(|image| {
                    image.ec_address == frame.ec_address
                        && image.memory_slot == frame.memory_slot
                        && !image.overwritten
                        && timeout.map_or(true, |t| {
                            frame.acquisition_time < image.acquisition_time + t
                        })
                });

                match target {
                    Some(image) => {
                        report.bound_frames.push((frame.uuid, image.uuid));
                        image.add_fragment(frame);
                        image.update_pending = true;
                    }
                    None => {
                        error!(
                            "{} - matching image with memory slot {} not found",
                            frame.name(),
                            frame.memory_slot
                        );
                        state.counters.lost_packets += 1;
                    }
                }
            }

            tm_id => {
                *report.other.entry(tm_id).or_default() += 1;

                // An image is sent in one telemetry sequence, so any
                // other TM id marks the end of the running transmission.
                if state.transmission_in_progress {
                    debug!("no more image packets in the current sequence");
                    for image in images.iter_mut() {
                        image.transmission_active = false;
                    }
                    for ec in &mut ecs.entries {
                        ec.transmission_active = false;
                    }
                    state.transmission_in_progress = false;
                }
            }
        }
    }

    report.log();
    report
}

/// Marks open images older than the timeout as outdated. They are
/// dropped from the working set after their final persist.
pub fn check_outdated(
    images: &mut [Image],
    timeout: Option<Duration>,
    now: DateTime<Utc>,
) -> usize {
    let Some(timeout) = timeout else { return 0 };

    let mut marked = 0;
    for image in images.iter_mut().filter(|image| !image.outdated) {
        if now - image.acquisition_time >= timeout {
            image.outdated = true;
            marked += 1;
            warn!(
                "{} is incomplete ({}/{}) and OUTDATED",
                image.name,
                image.received_fragments(),
                image.expected_fragments
            );
        }
    }
    marked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::testing::{flir_data_frame, frame, init_frame, ucam_data_frame};

    fn setup() -> (Vec<Image>, ReceiverState, EcTable, AssemblyOptions) {
        (
            Vec::new(),
            ReceiverState::default(),
            EcTable::new(),
            AssemblyOptions::default(),
        )
    }

    fn with_time_tag(mut data: Vec<u8>, tag: u32) -> Vec<u8> {
        data[4..8].copy_from_slice(&tag.to_be_bytes());
        data
    }

    #[test]
    fn init_opens_an_image() {
        let (mut images, mut state, mut ecs, options) = setup();
        ingest(
            vec![frame(init_frame(TM_FLIR_INIT, 3, 63))],
            &mut images,
            &mut state,
            &mut ecs,
            &options,
        );

        assert_eq!(images.len(), 1);
        assert_eq!(images[0].memory_slot, 3);
        assert_eq!(state.counters.initialized_images, 1);
        assert_eq!(state.counters.waps_image_packets, 1);
        assert!(state.transmission_in_progress);
        assert!(ecs.entry(171).transmission_active);
    }

    #[test]
    fn duplicate_init_is_a_no_op() {
        let (mut images, mut state, mut ecs, options) = setup();
        let batch = vec![
            frame(init_frame(TM_UCAM_INIT, 6, 33)),
            frame(init_frame(TM_UCAM_INIT, 6, 33)),
        ];
        ingest(batch, &mut images, &mut state, &mut ecs, &options);

        assert_eq!(images.len(), 1);
        assert!(!images[0].overwritten);
    }

    #[test]
    fn second_init_overwrites_the_slot() {
        let (mut images, mut state, mut ecs, options) = setup();
        let batch = vec![
            frame(with_time_tag(init_frame(TM_UCAM_INIT, 3, 33), 100)),
            frame(with_time_tag(init_frame(TM_UCAM_INIT, 3, 33), 200)),
        ];
        ingest(batch, &mut images, &mut state, &mut ecs, &options);

        assert_eq!(images.len(), 2);
        assert!(images[0].overwritten);
        assert!(!images[1].overwritten);

        // Data frames now bind to the replacement image only.
        let report = ingest(
            vec![frame(ucam_data_frame(3, 0, &[1; 10]))],
            &mut images,
            &mut state,
            &mut ecs,
            &options,
        );
        assert_eq!(report.bound_frames.len(), 1);
        assert_eq!(report.bound_frames[0].1, images[1].uuid);
        assert_eq!(images[0].received_fragments(), 0);
        assert_eq!(images[1].received_fragments(), 1);
    }

    #[test]
    fn data_without_an_image_is_lost() {
        let (mut images, mut state, mut ecs, options) = setup();
        ingest(
            vec![frame(flir_data_frame(2, 0))],
            &mut images,
            &mut state,
            &mut ecs,
            &options,
        );

        assert!(images.is_empty());
        assert_eq!(state.counters.lost_packets, 1);
        assert_eq!(state.counters.waps_image_packets, 1);
    }

    #[test]
    fn data_binds_and_flags_an_update() {
        let (mut images, mut state, mut ecs, options) = setup();
        ingest(
            vec![
                frame(init_frame(TM_FLIR_INIT, 0, 63)),
                frame(flir_data_frame(0, 0)),
                frame(flir_data_frame(0, 1)),
            ],
            &mut images,
            &mut state,
            &mut ecs,
            &options,
        );

        assert_eq!(images[0].received_fragments(), 2);
        assert!(images[0].update_pending);
        assert_eq!(state.counters.waps_image_packets, 3);
    }

    #[test]
    fn boundary_frame_closes_the_sequence() {
        let (mut images, mut state, mut ecs, options) = setup();
        ingest(
            vec![
                frame(init_frame(TM_FLIR_INIT, 0, 63)),
                frame(crate::frame::testing::base_frame(0x1200, 0, 0)),
            ],
            &mut images,
            &mut state,
            &mut ecs,
            &options,
        );

        assert!(!state.transmission_in_progress);
        assert!(!images[0].transmission_active);
        assert!(!ecs.entry(171).transmission_active);
    }

    #[test]
    fn slot_change_detection_marks_overwritten() {
        let (mut images, mut state, mut ecs, mut options) = setup();
        options.detect_slot_change = true;

        // The init frame reports slot 5 as current; a later frame
        // reporting slot 5 again after a change dooms the open image.
        let mut init = init_frame(TM_UCAM_INIT, 5, 33);
        init[56..58].copy_from_slice(&(5u16 << 12).to_be_bytes());
        ingest(
            vec![frame(init)],
            &mut images,
            &mut state,
            &mut ecs,
            &options,
        );
        assert!(!images[0].overwritten);
        assert_eq!(ecs.entry(171).last_memory_slot, Some(5));

        let mut other = crate::frame::testing::base_frame(0x1200, 0, 0);
        other[56..58].copy_from_slice(&(5u16 << 12).to_be_bytes());
        let mut boundary = crate::frame::testing::base_frame(0x1200, 0, 0);
        boundary[56..58].copy_from_slice(&(2u16 << 12).to_be_bytes());

        ingest(
            vec![frame(boundary), frame(other)],
            &mut images,
            &mut state,
            &mut ecs,
            &options,
        );
        assert!(images[0].overwritten);
    }

    #[test]
    fn timed_out_image_rejects_late_data() {
        let (mut images, mut state, mut ecs, mut options) = setup();
        options.image_timeout = Some(Duration::minutes(0));

        ingest(
            vec![frame(init_frame(TM_FLIR_INIT, 0, 63))],
            &mut images,
            &mut state,
            &mut ecs,
            &options,
        );
        // With a zero timeout the matching window is empty.
        ingest(
            vec![frame(flir_data_frame(0, 0))],
            &mut images,
            &mut state,
            &mut ecs,
            &options,
        );
        assert_eq!(images[0].received_fragments(), 0);
        assert_eq!(state.counters.lost_packets, 1);

        // Disabled timeouts accept everything.
        options.image_timeout = None;
        ingest(
            vec![frame(flir_data_frame(0, 1))],
            &mut images,
            &mut state,
            &mut ecs,
            &options,
        );
        assert_eq!(images[0].received_fragments(), 1);
    }

    #[test]
    fn outdated_sweep_honours_the_timeout() {
        let (mut images, mut state, mut ecs, options) = setup();
        ingest(
            vec![frame(init_frame(TM_FLIR_INIT, 0, 63))],
            &mut images,
            &mut state,
            &mut ecs,
            &options,
        );

        let now = Utc::now();
        assert_eq!(check_outdated(&mut images, None, now), 0);
        assert_eq!(
            check_outdated(&mut images, Some(Duration::minutes(60)), now),
            0
        );
        assert_eq!(
            check_outdated(
                &mut images,
                Some(Duration::minutes(60)),
                now + Duration::minutes(61)
            ),
            1
        );
        assert!(images[0].outdated);
    }

    #[test]
    fn ec_table_seeds_and_assigns_columns() {
        let mut ecs = EcTable::seed([(171, ".EC_A4".to_string())]);
        assert_eq!(ecs.position(171), ".EC_A4");
        assert_eq!(ecs.position(200), "?");

        for address in [10, 11, 12, 13] {
            ecs.entry(address);
        }
        // 171 took column 0; the fifth EC finds no free column.
        assert_eq!(ecs.entry(171).panel_column, Some(0));
        assert_eq!(ecs.entry(12).panel_column, Some(3));
        assert_eq!(ecs.entry(13).panel_column, None);
    }
}
