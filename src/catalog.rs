//! Relational index of ingested frames and reassembled images.
//!
//! Every accepted frame gets one append-only row; every opened image
//! gets a row that tracks its current reassembly state, so operators
//! can audit losses and request retransmits long after the working set
//! has moved on.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::Frame;
use crate::image::Image;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Handle to the catalog store. One per process.
pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    /// Opens (and if necessary creates) the catalog file.
    pub fn open(path: &Path) -> Result<Catalog, CatalogError> {
        if !path.exists() {
            warn!("catalog {} does not exist yet, creating it", path.display());
        }
        let conn = Connection::open(path)?;
        info!("opened catalog {}", path.display());
        Self::with_connection(conn)
    }

    /// An in-memory catalog, used by the tests.
    pub fn open_in_memory() -> Result<Catalog, CatalogError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Catalog, CatalogError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS packets (
                packet_uuid TEXT PRIMARY KEY,
                acquisition_time TEXT,
                ccsds_time TEXT,
                raw_bytes BLOB,
                time_tag INTEGER,
                packet_name TEXT,
                ec_address INTEGER,
                generic_tm_id INTEGER,
                generic_tm_type INTEGER,
                generic_tm_length INTEGER,
                image_memory_slot INTEGER,
                tm_packet_id INTEGER,
                image_number_of_packets INTEGER,
                data_packet_id INTEGER,
                data_packet_crc INTEGER,
                data_packet_size INTEGER,
                data_packet_verify_code INTEGER,
                good_packet INTEGER,
                image_id TEXT
            );
            CREATE TABLE IF NOT EXISTS images (
                image_uuid TEXT PRIMARY KEY,
                acquisition_time TEXT,
                ccsds_time TEXT,
                time_tag INTEGER,
                image_name TEXT,
                camera_type TEXT,
                ec_address INTEGER,
                ec_position TEXT,
                memory_slot INTEGER,
                number_of_packets INTEGER,
                received_packets INTEGER,
                overwritten INTEGER,
                outdated INTEGER,
                transmission_active INTEGER,
                update_pending INTEGER,
                latest_image_file TEXT,
                latest_data_file TEXT,
                latest_tm_file TEXT,
                finalization_time TEXT
            );",
        )?;
        Ok(Catalog { conn })
    }

    /// Records an accepted frame. Re-inserting the same frame is a
    /// no-op, which keeps retried batches harmless.
    pub fn insert_packet(&self, frame: &Frame, good: bool) -> Result<(), CatalogError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO packets VALUES
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                frame.uuid.to_string(),
                frame.acquisition_time.to_rfc3339(),
                frame.ccsds_time.to_rfc3339(),
                frame.raw(),
                i64::from(frame.time_tag),
                frame.name(),
                frame.ec_address,
                frame.generic_tm_id,
                frame.generic_tm_type,
                frame.generic_tm_length,
                frame.memory_slot,
                frame.fragment_id,
                frame.expected_fragments,
                frame.data_fragment_id,
                frame.declared_crc,
                frame.payload_size,
                frame.declared_verify_code,
                good,
                "unassigned",
            ],
        )?;
        Ok(())
    }

    /// Binds a frame row to the image that accepted it.
    pub fn assign_packet_image(&self, packet: Uuid, image: Uuid) -> Result<(), CatalogError> {
        self.conn.execute(
            "UPDATE packets SET image_id = ?1 WHERE packet_uuid = ?2",
            params![image.to_string(), packet.to_string()],
        )?;
        Ok(())
    }

    /// Inserts or refreshes an image row with its current reassembly
    /// snapshot. `finalization` is recorded once, when the completed
    /// image leaves the working set.
    pub fn upsert_image(
        &self,
        image: &Image,
        finalization: Option<DateTime<Utc>>,
    ) -> Result<(), CatalogError> {
        self.conn.execute(
            "INSERT INTO images VALUES
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
             ON CONFLICT(image_uuid) DO UPDATE SET
                received_packets = excluded.received_packets,
                overwritten = excluded.overwritten,
                outdated = excluded.outdated,
                transmission_active = excluded.transmission_active,
                update_pending = excluded.update_pending,
                latest_image_file = excluded.latest_image_file,
                latest_data_file = excluded.latest_data_file,
                latest_tm_file = excluded.latest_tm_file,
                finalization_time = COALESCE(excluded.finalization_time, images.finalization_time)",
            params![
                image.uuid.to_string(),
                image.acquisition_time.to_rfc3339(),
                image.ccsds_time.to_rfc3339(),
                i64::from(image.time_tag),
                image.name,
                image.camera.label(),
                image.ec_address,
                image.ec_position,
                image.memory_slot,
                image.expected_fragments,
                image.received_fragments() as i64,
                image.overwritten,
                image.outdated,
                image.transmission_active,
                image.update_pending,
                image
                    .latest_image_file
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                image
                    .latest_data_file
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                image
                    .latest_tm_file
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                finalization.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::testing::{flir_data_frame, frame, init_frame};
    use crate::frame::TM_FLIR_INIT;

    fn count(catalog: &Catalog, table: &str) -> i64 {
        catalog
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            })
            .unwrap()
    }

    #[test]
    fn duplicate_packet_rows_are_suppressed() {
        let catalog = Catalog::open_in_memory().unwrap();
        let packet = frame(flir_data_frame(0, 1));

        catalog.insert_packet(&packet, true).unwrap();
        catalog.insert_packet(&packet, true).unwrap();
        assert_eq!(count(&catalog, "packets"), 1);

        let good: bool = catalog
            .conn
            .query_row("SELECT good_packet FROM packets", [], |row| row.get(0))
            .unwrap();
        assert!(good);
    }

    #[test]
    fn packet_rows_start_unassigned() {
        let catalog = Catalog::open_in_memory().unwrap();
        let packet = frame(flir_data_frame(0, 1));
        catalog.insert_packet(&packet, true).unwrap();

        let image_id: String = catalog
            .conn
            .query_row("SELECT image_id FROM packets", [], |row| row.get(0))
            .unwrap();
        assert_eq!(image_id, "unassigned");

        let image = Image::from_init(&frame(init_frame(TM_FLIR_INIT, 0, 63)), "?").unwrap();
        catalog.assign_packet_image(packet.uuid, image.uuid).unwrap();
        let image_id: String = catalog
            .conn
            .query_row("SELECT image_id FROM packets", [], |row| row.get(0))
            .unwrap();
        assert_eq!(image_id, image.uuid.to_string());
    }

    #[test]
    fn image_rows_track_reassembly_state() {
        let catalog = Catalog::open_in_memory().unwrap();
        let mut image = Image::from_init(&frame(init_frame(TM_FLIR_INIT, 0, 63)), "?").unwrap();

        catalog.upsert_image(&image, None).unwrap();
        image.add_fragment(frame(flir_data_frame(0, 0)));
        image.overwritten = true;
        catalog.upsert_image(&image, None).unwrap();
        assert_eq!(count(&catalog, "images"), 1);

        let (received, overwritten, finalized): (i64, bool, Option<String>) = catalog
            .conn
            .query_row(
                "SELECT received_packets, overwritten, finalization_time FROM images",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(received, 1);
        assert!(overwritten);
        assert!(finalized.is_none());

        // Finalization sticks once recorded.
        catalog.upsert_image(&image, Some(Utc::now())).unwrap();
        catalog.upsert_image(&image, None).unwrap();
        let finalized: Option<String> = catalog
            .conn
            .query_row("SELECT finalization_time FROM images", [], |row| row.get(0))
            .unwrap();
        assert!(finalized.is_some());
    }
}
