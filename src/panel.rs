//! One-way event feed for an optional status panel.
//!
//! The ingest loop pushes updates into a bounded queue; whatever sits
//! on the other end (a GUI thread, a test harness, nothing at all)
//! never mutates core state. A full or disconnected queue drops the
//! update rather than stalling ingestion.

use std::path::PathBuf;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::trace;

use crate::assemble::Counters;
use crate::image::Image;

/// Updates the core publishes for display.
#[derive(Debug, Clone)]
pub enum PanelEvent {
    ServerConnected,
    ServerDisconnected,
    CountersChanged(Counters),
    ImageChanged(ImageStatus),
    FileSaved(PathBuf),
}

/// Display snapshot of one image.
#[derive(Debug, Clone)]
pub struct ImageStatus {
    pub name: String,
    pub ec_address: u8,
    pub ec_position: String,
    /// Column the owning EC occupies in the panel grid.
    pub panel_column: Option<u8>,
    /// One of `In progress`, `Finished`, `Incomplete`, `Overwritten`,
    /// `Outdated`.
    pub status: &'static str,
    pub percent: u8,
}

impl ImageStatus {
    pub fn of(image: &Image, panel_column: Option<u8>) -> ImageStatus {
        ImageStatus {
            name: image.name.clone(),
            ec_address: image.ec_address,
            ec_position: image.ec_position.clone(),
            panel_column,
            status: image.status_label(),
            percent: image.completeness_percent(),
        }
    }
}

/// Sending half handed to the ingest loop.
#[derive(Debug, Clone)]
pub struct PanelSender {
    tx: Sender<PanelEvent>,
}

impl PanelSender {
    /// Non-blocking send. Dropped updates are harmless since every
    /// event carries a full snapshot.
    pub fn send(&self, event: PanelEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => trace!("panel queue full, dropping an update"),
            Err(TrySendError::Disconnected(_)) => trace!("panel is gone, dropping an update"),
        }
    }
}

/// Creates the bounded panel channel.
pub fn channel(capacity: usize) -> (PanelSender, Receiver<PanelEvent>) {
    let (tx, rx) = bounded(capacity);
    (PanelSender { tx }, rx)
}
