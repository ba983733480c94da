//! Traffic Engine
//!
//! Live camera monitoring: pulls frames from a remote feed, detects and
//! tracks road users, keeps a running count of unique objects, and
//! re-broadcasts the annotated video as MJPEG next to a JSON stats endpoint.
//!
//! # Architecture
//!
//! Stages hand data to each other through single-slot cells (`LatestCell`),
//! never queues, so a slow stage sees stale data but never a backlog:
//!
//! ```text
//! camera -> FrameSource -> FrameCompositor -> StreamBroadcaster -> viewers
//!                               |     ^
//!                        frame  v     | boxes
//!                          DetectionWorker -> HistoryStore, StatsBoard
//! ```
//!
//! Capture and inference only run while the `ActivityGate` is open, i.e.
//! while someone is watching the video or polling stats.
//!
//! # Module Structure
//!
//! - `ingest`: capture devices and the reconnecting connection wrapper
//! - `source`: capture thread
//! - `render`: resize, correction, overlays, JPEG encoding
//! - `detect`: detector backends and the IoU tracker
//! - `worker`, `counter`: detection loop and unique-id counting
//! - `broadcast`, `api`: MJPEG fan-out and the HTTP server
//! - `history`, `stats`: all-time total and the stats snapshot
//! - `engine`, `config`: wiring, lifecycle and configuration

pub mod activity;
pub mod api;
pub mod broadcast;
pub mod cell;
pub mod config;
pub mod counter;
pub mod detect;
pub mod engine;
pub mod frame;
pub mod history;
pub mod ingest;
pub mod render;
pub mod source;
pub mod stats;
pub mod worker;

pub use activity::{ActivityGate, ViewerGuard};
pub use api::{ApiConfig, ApiHandle, ApiServer, ApiState};
pub use broadcast::{StreamBroadcaster, ViewerStream};
pub use cell::LatestCell;
pub use config::EngineConfig;
pub use counter::TrackedIdRegistry;
pub use detect::{
    build_backend, BoundingBox, ClassCounts, Detection, DetectionSet, DetectorBackend,
    ObjectClass,
};
pub use engine::{Engine, EngineHandle};
pub use frame::{EncodedFrame, Frame};
pub use history::{HistoryRecord, HistoryStore};
pub use ingest::{open_capture, CaptureSettings, ResilientConnection, VideoCapture};
pub use render::{FrameCompositor, TickOutcome};
pub use source::FrameSource;
pub use stats::{StatsBoard, StatsEndpoint, StatsSnapshot, Status};
pub use worker::{CycleOutcome, DetectionWorker};
