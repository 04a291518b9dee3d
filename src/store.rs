//! On-disk persistence of rendered image artefacts.
//!
//! Writes are idempotent and versioned: identical bytes at the target
//! path are a no-op, differing bytes go to the lowest free `vN`
//! sibling. A temp-then-rename dance keeps every artefact atomic, so a
//! cancelled run never leaves a half-written file at its final path.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use crate::assemble::Counters;
use crate::image::{sequence_printout, Image};
use crate::render;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not move the finished file into place: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Writes `bytes` to `path`, or to a versioned sibling when `path`
/// already holds different data. Returns the path that now holds the
/// bytes. Dissimilar content is never overwritten.
pub fn write_versioned(bytes: &[u8], path: &Path) -> Result<PathBuf, StoreError> {
    let mut target = path.to_path_buf();
    let mut version = 2;

    while target.exists() {
        if fs::read(&target)? == bytes {
            info!(
                "file {} with identical data exists already, nothing to do",
                target.display()
            );
            return Ok(target);
        }
        info!(
            "file {} exists already but data is different",
            target.display()
        );
        target = versioned_path(path, version);
        version += 1;
    }

    let directory = target.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(directory)?;
    std::io::Write::write_all(&mut temp, bytes)?;
    temp.persist(&target)?;

    info!("saved file {}", target.display());
    Ok(target)
}

/// `image.jpg` with version 2 becomes `imagev2.jpg`.
fn versioned_path(path: &Path, version: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match path.extension() {
        Some(ext) => path.with_file_name(format!("{}v{}.{}", stem, version, ext.to_string_lossy())),
        None => path.with_file_name(format!("{}v{}", stem, version)),
    }
}

/// Persists every image with a pending update under `root/<YYYYMMDD>/`,
/// then retires what no longer belongs in the working set: completed
/// images (counted), and overwritten or outdated ones once their final
/// state is on disk. Returns the retired images.
pub fn save_images(images: &mut Vec<Image>, root: &Path, counters: &mut Counters) -> Vec<Image> {
    let mut retired = Vec::new();
    let mut index = 0;

    while index < images.len() {
        let image = &mut images[index];

        let mut write_ok = true;
        if image.update_pending {
            write_ok = save_one(image, root);
            if write_ok {
                image.update_pending = false;
            }
        }

        if write_ok && image.is_complete() {
            counters.completed_images += 1;
            debug!("image completed and removed from memory: {}", image);
            retired.push(images.remove(index));
            continue;
        }

        if (image.overwritten || image.outdated) && !image.update_pending {
            debug!("image dropped from the working set: {}", image);
            retired.push(images.remove(index));
            continue;
        }

        index += 1;
    }

    retired
}

/// Writes one image's artefacts. Returns false when any write failed;
/// the pending flag then stays set and the next pass retries.
fn save_one(image: &mut Image, root: &Path) -> bool {
    let date_dir = root.join(image.acquisition_time.format("%Y%m%d").to_string());
    if let Err(e) = fs::create_dir_all(&date_dir) {
        error!("could not create {}: {}", date_dir.display(), e);
        return false;
    }

    let mut data = image.reconstruct();
    let missing = image.missing_fragments(false);
    let percent = image.completeness_percent();

    let received = usize::from(image.expected_fragments) - missing.len();
    let message = format!(
        "image {} is {}% complete ({}/{})",
        image.name, percent, received, image.expected_fragments
    );
    if missing.is_empty() {
        info!("{}", message);
    } else if image.transmission_active {
        info!("{}, missing fragments: {}", message, sequence_printout(&missing));
    } else {
        warn!("{}, missing fragments: {}", message, sequence_printout(&missing));
    }

    let stem = if image.ec_position == "?" {
        format!("EC_{}", image.ec_address)
    } else {
        image.ec_position.clone()
    };
    let base = format!(
        "{}_{}_{}_m{}_{}_{}",
        stem,
        image.camera.label(),
        image.ccsds_time.format("%H%M%S"),
        image.memory_slot,
        image.time_tag,
        percent
    );

    let previous = (
        image.latest_image_file.clone(),
        image.latest_tm_file.clone(),
        image.latest_data_file.clone(),
    );

    match image.camera {
        crate::frame::CameraType::Ucam => {
            if !render::ucam_has_jpeg_header(&data) {
                warn!("{} does not have a JPEG header", image.name);
            }
            let path = date_dir.join(format!("{}.jpg", base));
            match write_versioned(&data, &path) {
                Ok(written) => image.latest_image_file = Some(written),
                Err(e) => {
                    error!("could not write {}: {}", path.display(), e);
                    return false;
                }
            }
        }
        crate::frame::CameraType::Flir => {
            if data.len() != render::FLIR_IMAGE_LEN {
                warn!("{} has incorrect data size: {}", image.name, data.len());
                data.resize(render::FLIR_IMAGE_LEN, 0);
            }

            let tm_path = date_dir.join(format!("{}_tm.txt", base));
            match write_versioned(render::flir_tm_text(&data).as_bytes(), &tm_path) {
                Ok(written) => image.latest_tm_file = Some(written),
                Err(e) => {
                    error!("could not write {}: {}", tm_path.display(), e);
                    return false;
                }
            }

            let csv_path = date_dir.join(format!("{}_data.csv", base));
            match write_versioned(render::flir_csv(&data).as_bytes(), &csv_path) {
                Ok(written) => image.latest_data_file = Some(written),
                Err(e) => {
                    error!("could not write {}: {}", csv_path.display(), e);
                    return false;
                }
            }

            let bmp = match render::flir_bmp(&data) {
                Ok(bmp) => bmp,
                Err(e) => {
                    error!("could not render {}: {}", image.name, e);
                    return false;
                }
            };
            let bmp_path = date_dir.join(format!("{}.bmp", base));
            match write_versioned(&bmp, &bmp_path) {
                Ok(written) => image.latest_image_file = Some(written),
                Err(e) => {
                    error!("could not write {}: {}", bmp_path.display(), e);
                    return false;
                }
            }
        }
    }

    retire_previous(previous.0.as_deref(), image.latest_image_file.as_deref());
    retire_previous(previous.1.as_deref(), image.latest_tm_file.as_deref());
    retire_previous(previous.2.as_deref(), image.latest_data_file.as_deref());

    true
}

/// Removes a superseded artefact version, but never the file that was
/// just written.
fn retire_previous(previous: Option<&Path>, current: Option<&Path>) {
    let Some(previous) = previous else { return };
    if Some(previous) == current || !previous.exists() {
        return;
    }
    match fs::remove_file(previous) {
        Ok(()) => info!("removed previous version {}", previous.display()),
        Err(e) => warn!("could not remove {}: {}", previous.display(), e),
    }
}
