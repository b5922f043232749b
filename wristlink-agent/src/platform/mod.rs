//! Platform adapter boundary
//!
//! Everything the core needs from the host platform: permission checks,
//! the paired-device table, a byte-stream to a device, and location fixes.
//! The orchestrator and device link consume this trait; the real Bluetooth
//! and location providers live behind it. A TCP-backed adapter ships
//! in-tree for development and integration testing.

pub mod tcp;

use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// Well-known serial channel tag shared by both ends of the link
/// (standard SPP service identifier). Adapters backed by a real
/// serial-capable transport select the channel with it.
pub const SERIAL_SERVICE_ID: &str = "00001101-0000-1000-8000-00805f9b34fb";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionKind {
    DeviceConnect,
    FineLocation,
}

/// An already-bonded device as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondedDevice {
    pub id: String,
    pub display_name: String,
}

/// A raw location fix. Batches may carry several; the smallest
/// `accuracy_m` (uncertainty radius) wins.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationFix {
    pub lat: f64,
    pub lon: f64,
    pub accuracy_m: f32,
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("missing {0:?} permission")]
    PermissionDenied(PermissionKind),
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

/// Host platform operations consumed by the core.
pub trait Platform: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Checked before any device/location operation; `false` is an
    /// immediate, non-retried failure of that operation.
    fn has_permission(&self, kind: PermissionKind) -> bool;

    fn bonded_devices(&self) -> Result<Vec<BondedDevice>, PlatformError>;

    /// Open the byte-stream to a bonded device over the well-known
    /// serial channel.
    fn open_stream(&self, device_id: &str) -> BoxFuture<'static, Result<Self::Stream, PlatformError>>;

    /// System device name, e.g. `Android-50`. Identity-recovery hint.
    fn system_device_name(&self) -> Option<String>;

    /// User-assigned alias of a bonded device, e.g.
    /// `UserID-7-SmartWatchID-3`. Identity-recovery hint.
    fn device_alias(&self, device_id: &str) -> Option<String>;

    /// One-shot last known fix, if any.
    fn last_location(&self) -> BoxFuture<'static, Option<LocationFix>>;

    /// Start pushing fix batches into `sink`. The source decides cadence
    /// and accuracy trade-offs; `min_interval` is a floor.
    fn start_location_updates(&self, min_interval: Duration, sink: mpsc::Sender<Vec<LocationFix>>);

    fn stop_location_updates(&self);
}
