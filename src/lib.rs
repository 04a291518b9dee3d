//! # `waps-ies`
//!
//! A ground-segment image extraction service for WAPS experiment
//! telemetry. A BIOLAB rack hosts WAPS experiment controllers (ECs),
//! each driving a FLIR thermal sensor and a uCAM colour sensor; their
//! imagery is downlinked fragmented across fixed 254-byte BIOLAB TM
//! frames multiplexed into a CCSDS packet stream.
//!
//! Common abbreviations:
//!
//! - EC: experiment controller;
//! - TM: telemetry;
//! - BIOLAB: the hosting rack, whose 254-byte TM frame carries the
//!   image fragments;
//! - memory slot: onboard ring-buffer index (0..=7) identifying one
//!   acquisition.
//!
//! The pipeline runs in one cooperative loop: the [`stream`](stream)
//! decoder pulls CCSDS packets off the socket, [`frame`](frame)
//! validates each embedded BIOLAB frame, [`assemble`](assemble) folds
//! frames into per-(EC, memory slot) [`image`](image) aggregates,
//! [`render`](render) and [`store`](store) produce and persist the
//! artefacts, and [`catalog`](catalog) indexes everything for audit.
//!
//! Usage is simple:
//! ```
//! use waps_ies::CcsdsDecoder;
//!
//! // or a std::net::TcpStream, or anything else that implements std::io::Read
//! let stream: &[u8] = &[
//!     // ...
//! ];
//! let mut decoder = CcsdsDecoder::new(stream);
//! while let Ok(Some(frame)) = decoder.next_frame() {
//!     // ...
//! }
//! ```

pub mod assemble;
pub mod catalog;
pub mod config;
pub mod frame;
pub mod image;
pub mod net;
pub mod panel;
pub mod reader;
pub mod render;
pub mod store;
pub mod stream;

pub use assemble::{AssemblyOptions, Counters, EcTable, ReceiverState};
pub use catalog::Catalog;
pub use config::{Config, ConfigError, LogLevel};
pub use frame::{CameraType, Frame};
pub use image::Image;
pub use net::Ingest;
pub use panel::{PanelEvent, PanelSender};
pub use stream::{CcsdsDecoder, CcsdsPacket, StreamError};
