//! Reassembly scenarios driven through the public pipeline API.

mod common;

use common::*;
use waps_ies::assemble::{check_outdated, ingest, AssemblyOptions, EcTable, ReceiverState};
use waps_ies::frame::{TM_FLIR_INIT, TM_UCAM_INIT};
use waps_ies::image::FLIR_FRAGMENT_LEN;
use waps_ies::store::save_images;
use waps_ies::Image;

fn setup() -> (Vec<Image>, ReceiverState, EcTable, AssemblyOptions) {
    (
        Vec::new(),
        ReceiverState::default(),
        EcTable::new(),
        AssemblyOptions::default(),
    )
}

#[test]
fn five_ecs_share_a_memory_slot() {
    let (mut images, mut state, mut ecs, options) = setup();

    let mut batch = Vec::new();
    for ec in 171..=175 {
        batch.push(frame(init_frame(ec, TM_UCAM_INIT, 0, 33)));
    }
    for ec in 171..=175 {
        batch.push(frame(ucam_data_frame(ec, 0, 1, &[ec; 100])));
    }
    ingest(batch, &mut images, &mut state, &mut ecs, &options);

    assert_eq!(images.len(), 5);
    for image in &images {
        assert_eq!(image.received_fragments(), 1);
        assert!(!image.overwritten);
    }
    assert_eq!(state.counters.initialized_images, 5);
    assert_eq!(state.counters.waps_image_packets, 10);
    assert_eq!(state.counters.lost_packets, 0);
}

#[test]
fn data_frames_without_an_init_are_reassembly_errors() {
    let (mut images, mut state, mut ecs, options) = setup();

    let batch = (0..5)
        .map(|id| frame(flir_data_frame(171, 0, id)))
        .collect();
    ingest(batch, &mut images, &mut state, &mut ecs, &options);

    assert!(images.is_empty());
    assert_eq!(state.counters.lost_packets, 5);
    assert_eq!(state.counters.initialized_images, 0);
}

#[test]
fn slot_reuse_flags_the_earlier_image() {
    let (mut images, mut state, mut ecs, options) = setup();

    ingest(
        vec![frame(with_time_tag(
            init_frame(171, TM_UCAM_INIT, 3, 33),
            1000,
        ))],
        &mut images,
        &mut state,
        &mut ecs,
        &options,
    );
    ingest(
        vec![frame(with_time_tag(
            init_frame(171, TM_UCAM_INIT, 3, 33),
            2000,
        ))],
        &mut images,
        &mut state,
        &mut ecs,
        &options,
    );

    assert_eq!(images.len(), 2);
    assert!(images[0].overwritten);
    assert!(!images[1].overwritten);

    // Data frames bind to the replacement only; the doomed image never
    // grows again.
    ingest(
        vec![frame(ucam_data_frame(171, 3, 0, &[1; 50]))],
        &mut images,
        &mut state,
        &mut ecs,
        &options,
    );
    assert_eq!(images[0].received_fragments(), 0);
    assert_eq!(images[1].received_fragments(), 1);

    // A slot on another EC is a different channel entirely.
    ingest(
        vec![frame(with_time_tag(
            init_frame(172, TM_UCAM_INIT, 3, 33),
            3000,
        ))],
        &mut images,
        &mut state,
        &mut ecs,
        &options,
    );
    assert!(!images[1].overwritten);
}

#[test]
fn corrupted_flir_fragment_is_counted_once_and_zero_filled() {
    let (mut images, mut state, mut ecs, options) = setup();

    let mut corrupted = flir_data_frame(171, 0, 1);
    corrupted[100] ^= 0xFF; // payload byte, offset >= 94

    let mut batch = vec![frame(init_frame(171, TM_FLIR_INIT, 0, 3))];
    batch.push(frame(flir_data_frame(171, 0, 0)));
    batch.push(frame(corrupted));
    batch.push(frame(flir_data_frame(171, 0, 2)));

    // The receiver counts the corruption when it first observes it.
    for packet in &batch {
        if packet.is_image_frame() {
            let _ = packet.is_good_image_frame();
        }
        if packet.take_corruption_event() {
            state.counters.corrupted_packets += 1;
        }
    }
    assert_eq!(state.counters.corrupted_packets, 1);

    ingest(batch, &mut images, &mut state, &mut ecs, &options);
    let image = &images[0];
    assert_eq!(image.received_fragments(), 3);
    assert_eq!(image.missing_fragments(false), vec![1]);
    assert!(!image.is_complete());

    // Completeness and reconstruction keep re-checking integrity, yet
    // the counter never moves again.
    for packet in image.fragments() {
        if packet.take_corruption_event() {
            state.counters.corrupted_packets += 1;
        }
    }
    assert_eq!(state.counters.corrupted_packets, 1);

    let data = image.reconstruct();
    assert_eq!(
        &data[FLIR_FRAGMENT_LEN..2 * FLIR_FRAGMENT_LEN],
        &[0u8; FLIR_FRAGMENT_LEN][..]
    );
}

#[test]
fn dropped_fragment_completes_on_retransmit() {
    let (mut images, mut state, mut ecs, options) = setup();
    let dir = tempfile::tempdir().unwrap();

    // A full FLIR transmission with fragment 5 held back.
    let mut batch = vec![frame(init_frame(171, TM_FLIR_INIT, 0, 63))];
    for id in (0..63).filter(|id| *id != 5) {
        batch.push(frame(flir_data_frame(171, 0, id)));
    }
    ingest(batch, &mut images, &mut state, &mut ecs, &options);
    assert_eq!(images[0].missing_fragments(false), vec![5]);

    let retired = save_images(&mut images, dir.path(), &mut state.counters);
    assert!(retired.is_empty());
    assert_eq!(state.counters.completed_images, 0);

    let partial = images[0].latest_image_file.clone().unwrap();
    assert!(partial.to_string_lossy().ends_with("_98.bmp"));
    assert!(partial.exists());

    // The held-back fragment arrives on retransmit.
    ingest(
        vec![frame(flir_data_frame(171, 0, 5))],
        &mut images,
        &mut state,
        &mut ecs,
        &options,
    );
    let retired = save_images(&mut images, dir.path(), &mut state.counters);
    assert_eq!(retired.len(), 1);
    assert_eq!(state.counters.completed_images, 1);

    let finished = retired[0].latest_image_file.as_ref().unwrap();
    assert!(finished.to_string_lossy().ends_with("_100.bmp"));
    assert!(finished.exists());
    assert!(!partial.exists(), "partial version was retired");
}

#[test]
fn outdated_images_age_out_of_the_working_set() {
    let (mut images, mut state, mut ecs, mut options) = setup();
    options.image_timeout = Some(chrono::Duration::minutes(30));
    let dir = tempfile::tempdir().unwrap();

    ingest(
        vec![frame(init_frame(171, TM_FLIR_INIT, 0, 63))],
        &mut images,
        &mut state,
        &mut ecs,
        &options,
    );

    let later = chrono::Utc::now() + chrono::Duration::minutes(31);
    assert_eq!(check_outdated(&mut images, options.image_timeout, later), 1);

    // The final persist happens, then the image is gone.
    let retired = save_images(&mut images, dir.path(), &mut state.counters);
    assert!(images.is_empty());
    assert_eq!(retired.len(), 1);
    assert!(retired[0].outdated);
    assert_eq!(state.counters.completed_images, 0);
}

#[test]
fn complete_transmission_end_to_end() {
    let (mut images, mut state, mut ecs, options) = setup();
    let dir = tempfile::tempdir().unwrap();

    // One complete FLIR and one complete uCAM acquisition, closed by a
    // housekeeping frame, the way a real downlink sequence ends.
    let mut batch = vec![frame(init_frame(171, TM_FLIR_INIT, 0, 63))];
    for id in 0..63 {
        batch.push(frame(flir_data_frame(171, 0, id)));
    }
    batch.push(frame(init_frame(171, TM_UCAM_INIT, 6, 3)));
    let payloads: Vec<Vec<u8>> = vec![
        [0xFF, 0xD8, 0xFF, 0xDB].repeat(25),
        vec![0x42; 158],
        vec![0x17; 30],
    ];
    for (id, payload) in payloads.iter().enumerate() {
        batch.push(frame(ucam_data_frame(171, 6, id as u16, payload)));
    }
    batch.push(frame(base_frame(171, 0x1200, 0, 0)));

    ingest(batch, &mut images, &mut state, &mut ecs, &options);
    assert_eq!(images.len(), 2);
    assert!(!state.transmission_in_progress);
    assert!(images.iter().all(|image| image.is_complete()));

    let retired = save_images(&mut images, dir.path(), &mut state.counters);
    assert!(images.is_empty());
    assert_eq!(retired.len(), 2);
    assert_eq!(state.counters.completed_images, 2);

    // The JPEG on disk is exactly the concatenated payloads.
    let ucam = retired
        .iter()
        .find(|image| image.camera == waps_ies::CameraType::Ucam)
        .unwrap();
    let jpeg = std::fs::read(ucam.latest_image_file.as_ref().unwrap()).unwrap();
    let expected: Vec<u8> = payloads.concat();
    assert_eq!(jpeg, expected);

    // The FLIR artefacts exist with their sidecars.
    let flir = retired
        .iter()
        .find(|image| image.camera == waps_ies::CameraType::Flir)
        .unwrap();
    assert!(flir.latest_image_file.as_ref().unwrap().exists());
    assert!(flir.latest_tm_file.as_ref().unwrap().exists());
    assert!(flir.latest_data_file.as_ref().unwrap().exists());
}
