//! The TCP ingest loop.
//!
//! Drives the connection lifecycle and pumps every received CCSDS
//! packet through the full pipeline: frame extraction, integrity
//! check, assembly, persistence and cataloguing. The loop owns all
//! mutable state; nothing here is shared across threads except the
//! run flag and the one-way panel queue.

use std::collections::HashMap;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::assemble::{check_outdated, ingest, AssemblyOptions, EcTable, ReceiverState};
use crate::catalog::Catalog;
use crate::config::{Config, ConfigError};
use crate::frame::Frame;
use crate::image::Image;
use crate::panel::{ImageStatus, PanelEvent, PanelSender};
use crate::store::save_images;
use crate::stream::{extract_frame, CcsdsDecoder, StreamError};

/// The receiver: connection handling plus the working set of open
/// images and all receiver-wide state.
pub struct Ingest {
    server_address: String,
    tcp_timeout: std::time::Duration,
    output_path: PathBuf,
    assembly: AssemblyOptions,
    catalog: Catalog,
    panel: Option<PanelSender>,
    run: Arc<AtomicBool>,

    pub state: ReceiverState,
    images: Vec<Image>,
    ecs: EcTable,

    connection_failures: u64,
    timeout_notified: bool,
}

impl Ingest {
    pub fn new(config: &Config, catalog: Catalog) -> Result<Ingest, ConfigError> {
        Ok(Ingest {
            server_address: config.server_address()?,
            tcp_timeout: config.tcp_timeout(),
            output_path: config.output_path.clone(),
            assembly: config.assembly_options(),
            catalog,
            panel: None,
            run: Arc::new(AtomicBool::new(true)),
            state: ReceiverState::default(),
            images: Vec::new(),
            ecs: config.ec_table()?,
            connection_failures: 0,
            timeout_notified: false,
        })
    }

    /// Attaches the status panel queue.
    pub fn attach_panel(&mut self, panel: PanelSender) {
        self.panel = Some(panel);
    }

    /// Shared run flag; clearing it stops the loop after the current
    /// iteration.
    pub fn run_flag(&self) -> Arc<AtomicBool> {
        self.run.clone()
    }

    /// Images currently being reassembled.
    pub fn open_images(&self) -> &[Image] {
        &self.images
    }

    /// Connects, pumps and reconnects until the run flag clears, then
    /// prints the session summary.
    pub fn run(&mut self) {
        info!("# server: {}", self.server_address);
        info!("# TCP timeout: {:?}", self.tcp_timeout);
        info!("# starting reception");

        while self.run.load(Ordering::Relaxed) {
            if let Some(stream) = self.connect() {
                self.pump(stream);
            }
        }

        self.summary();
    }

    fn connect(&mut self) -> Option<TcpStream> {
        let address = match self.server_address.to_socket_addrs() {
            Ok(mut addresses) => addresses.next(),
            Err(e) => {
                error!("could not resolve {}: {}", self.server_address, e);
                None
            }
        };

        let attempt = address
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved")
            })
            .and_then(|address| TcpStream::connect_timeout(&address, self.tcp_timeout));

        match attempt {
            Ok(stream) => {
                info!("# TCP connection to {} established", self.server_address);
                self.connection_failures = 0;
                self.send(PanelEvent::ServerConnected);
                Some(stream)
            }
            Err(e) => {
                self.connection_failures += 1;
                // The first failures are worth a line each; a dead link
                // only gets a reminder every 60 attempts.
                if self.connection_failures < 10 || self.connection_failures % 60 == 0 {
                    error!(
                        "could not connect to the socket ({} attempts): {}",
                        self.connection_failures, e
                    );
                }
                std::thread::sleep(std::time::Duration::from_secs(1));
                None
            }
        }
    }

    fn pump(&mut self, stream: TcpStream) {
        if let Err(e) = stream.set_read_timeout(Some(self.tcp_timeout)) {
            error!("could not set the socket read timeout: {}", e);
            return;
        }

        let mut decoder = CcsdsDecoder::new(stream);
        while self.run.load(Ordering::Relaxed) {
            match decoder.next_packet() {
                Ok(packet) => {
                    self.timeout_notified = false;
                    self.state.counters.packets_received += 1;
                    self.state.last_ccsds_time = packet.ccsds_time;

                    if let Some(frame) = extract_frame(&packet, Utc::now()) {
                        self.state.counters.biolab_packets += 1;
                        self.apply_frames(vec![frame]);
                        tracing::debug!("{}", self.state.status_line());
                    }
                }
                Err(StreamError::Io(e))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    if !self.timeout_notified {
                        warn!(
                            "no CCSDS packets received for more than {:?}",
                            self.tcp_timeout
                        );
                        self.timeout_notified = true;
                    }
                    // Stalled images still have to age out.
                    self.sweep();
                }
                Err(e) => {
                    warn!("telemetry stream interrupted: {}", e);
                    self.send(PanelEvent::ServerDisconnected);
                    return;
                }
            }
        }
    }

    /// Runs a batch of in-spec frames through integrity check,
    /// catalog, assembly and persistence. Also the entry point for the
    /// offline archive and test-bench sources.
    pub fn apply_frames(&mut self, frames: Vec<Frame>) {
        for frame in &frames {
            let good = frame.is_image_frame() && frame.is_good_image_frame();
            if frame.take_corruption_event() {
                self.state.counters.corrupted_packets += 1;
            }
            if let Err(e) = self.catalog.insert_packet(frame, good) {
                warn!("catalog packet insert failed: {}", e);
            }
        }

        let report = ingest(
            frames,
            &mut self.images,
            &mut self.state,
            &mut self.ecs,
            &self.assembly,
        );
        for (packet, image) in &report.bound_frames {
            if let Err(e) = self.catalog.assign_packet_image(*packet, *image) {
                warn!("catalog packet assignment failed: {}", e);
            }
        }

        self.flush();
    }

    /// Ages out stalled images, flushing only when the sweep changed
    /// something.
    pub fn sweep(&mut self) {
        if check_outdated(&mut self.images, self.assembly.image_timeout, Utc::now()) > 0 {
            self.flush();
        }
    }

    /// Persists pending updates, refreshes the catalog and feeds the
    /// panel.
    fn flush(&mut self) {
        let before: HashMap<Uuid, Option<PathBuf>> = self
            .images
            .iter()
            .map(|image| (image.uuid, image.latest_image_file.clone()))
            .collect();

        let retired = save_images(&mut self.images, &self.output_path, &mut self.state.counters);

        let now = Utc::now();
        for image in &retired {
            let finalization = if image.is_complete() { Some(now) } else { None };
            if let Err(e) = self.catalog.upsert_image(image, finalization) {
                warn!("catalog image update failed: {}", e);
            }
        }
        for image in &self.images {
            if let Err(e) = self.catalog.upsert_image(image, None) {
                warn!("catalog image update failed: {}", e);
            }
        }

        if self.panel.is_some() {
            for image in retired.iter().chain(self.images.iter()) {
                let column = self
                    .ecs
                    .iter()
                    .find(|ec| ec.address == image.ec_address)
                    .and_then(|ec| ec.panel_column);
                self.send(PanelEvent::ImageChanged(ImageStatus::of(image, column)));

                if let Some(saved) = &image.latest_image_file {
                    if before.get(&image.uuid) != Some(&Some(saved.clone())) {
                        self.send(PanelEvent::FileSaved(saved.clone()));
                    }
                }
            }
            self.send(PanelEvent::CountersChanged(self.state.counters.clone()));
        }
    }

    fn send(&self, event: PanelEvent) {
        if let Some(panel) = &self.panel {
            panel.send(event);
        }
    }

    /// Session totals, printed on shutdown.
    pub fn summary(&self) {
        let counters = &self.state.counters;
        info!("# disconnected from server");
        info!("     session totals");
        info!("  CCSDS packets received:      {}", counters.packets_received);
        info!("  BIOLAB TM frames received:   {}", counters.biolab_packets);
        info!("  WAPS image packets received: {}", counters.waps_image_packets);
        info!("  Initialized images:          {}", counters.initialized_images);
        info!("  Completed images:            {}", counters.completed_images);
        info!("  Lost packets:                {}", counters.lost_packets);
        info!("  Corrupted packets:           {}", counters.corrupted_packets);
    }
}
