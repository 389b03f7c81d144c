//! Soundpath - Audio routing policy engine.
//!
//! Soundpath decides, for every playback and capture request on a device,
//! which physical endpoint the audio should flow through, and drives the
//! transitions: patch installation, volume sequencing and mute windows
//! around device changes. The main pieces are:
//!
//! - Device catalog and connection lifecycle
//! - Strategy-based device resolution with a pluggable engine
//! - Output/input stream selection and reuse
//! - Patch lifecycle with update-in-place rerouting
//! - Volume curves with telephony and sonification policy layered on top
//! - Capture concurrency arbitration
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use soundpath::{
//!     Config, DefaultPolicyEngine, FakeTransport, LinearVolumeCurves, RoutingManager,
//! };
//!
//! let manager = RoutingManager::new(
//!     Config::default_catalog(),
//!     Box::new(DefaultPolicyEngine::new()),
//!     Box::new(LinearVolumeCurves),
//!     FakeTransport::new(),
//! )?;
//! println!("primary output: {:?}", manager.primary_output());
//! # Ok::<(), soundpath::RoutingError>(())
//! ```

/// Per-request session and client model.
pub mod client;

/// Configuration schema and the hardware catalog.
pub mod config;

/// Core error types and result aliases.
pub mod core;

/// Physical device kinds, masks and descriptors.
pub mod device;

/// Strategy engine seam.
pub mod engine;

/// The routing manager.
pub mod manager;

/// Audio patches.
pub mod patch;

/// Hardware stream profiles and formats.
pub mod profile;

/// Open stream descriptors.
pub mod stream;

/// Tracing initialization for engine hosts.
pub mod tracing_config;

/// Transport command interface.
pub mod transport;

/// Volume curves and device categories.
pub mod volume;

pub use client::{AudioAttributes, CaptureSource, StreamType, Usage};
pub use config::Config;
pub use core::{Result, RoutingError};
pub use device::DeviceMask;
pub use engine::{DefaultPolicyEngine, ForceUse, ForcedConfig, PhoneState, PolicyEngine, Strategy};
pub use manager::{ConcurrencyKind, InputRequest, OutputRequest, RoutingManager};
pub use transport::{FakeTransport, Transport};
pub use volume::{LinearVolumeCurves, VolumeCurves};
