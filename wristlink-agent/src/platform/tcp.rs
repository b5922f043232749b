//! TCP-backed platform adapter
//!
//! Stands in for the real serial transport during development and
//! integration testing: the bonded-device table comes from configuration,
//! `open_stream` dials the device's TCP address, and location fixes replay
//! a fixed configured coordinate. Permissions are always granted, the host
//! process owns its own sockets.

use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{BondedDevice, LocationFix, Platform, PermissionKind, PlatformError};
use crate::config::AgentConfig;

/// One reachable device entry.
#[derive(Debug, Clone)]
pub struct TcpDevice {
    pub id: String,
    pub display_name: String,
    pub alias: Option<String>,
    pub addr: String,
}

pub struct TcpPlatform {
    devices: Vec<TcpDevice>,
    system_name: Option<String>,
    fixed_location: Option<LocationFix>,
    location_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpPlatform {
    pub fn new(
        devices: Vec<TcpDevice>,
        system_name: Option<String>,
        fixed_location: Option<LocationFix>,
    ) -> Self {
        Self {
            devices,
            system_name,
            fixed_location,
            location_task: Mutex::new(None),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        let devices = config
            .device
            .devices
            .iter()
            .map(|d| TcpDevice {
                id: d.id.clone(),
                display_name: d.display_name.clone(),
                alias: d.alias.clone(),
                addr: d.addr.clone(),
            })
            .collect();
        let fixed_location = config.location.fixed.as_ref().map(|f| LocationFix {
            lat: f.lat,
            lon: f.lon,
            accuracy_m: f.accuracy_m,
        });
        Self::new(devices, config.device.system_name.clone(), fixed_location)
    }

    fn device(&self, device_id: &str) -> Option<&TcpDevice> {
        self.devices.iter().find(|d| d.id == device_id)
    }
}

impl Platform for TcpPlatform {
    type Stream = TcpStream;

    fn has_permission(&self, _kind: PermissionKind) -> bool {
        true
    }

    fn bonded_devices(&self) -> Result<Vec<BondedDevice>, PlatformError> {
        Ok(self
            .devices
            .iter()
            .map(|d| BondedDevice {
                id: d.id.clone(),
                display_name: d.display_name.clone(),
            })
            .collect())
    }

    fn open_stream(&self, device_id: &str) -> BoxFuture<'static, Result<TcpStream, PlatformError>> {
        let target = self.device(device_id).map(|d| d.addr.clone());
        let device_id = device_id.to_string();
        Box::pin(async move {
            let addr = target.ok_or(PlatformError::UnknownDevice(device_id.clone()))?;
            debug!(%device_id, %addr, "dialing device");
            let stream = TcpStream::connect(&addr).await?;
            Ok(stream)
        })
    }

    fn system_device_name(&self) -> Option<String> {
        self.system_name.clone()
    }

    fn device_alias(&self, device_id: &str) -> Option<String> {
        self.device(device_id).and_then(|d| d.alias.clone())
    }

    fn last_location(&self) -> BoxFuture<'static, Option<LocationFix>> {
        let fix = self.fixed_location;
        Box::pin(async move { fix })
    }

    fn start_location_updates(&self, min_interval: Duration, sink: mpsc::Sender<Vec<LocationFix>>) {
        let Some(fix) = self.fixed_location else {
            info!("no fixed location configured, location updates disabled");
            return;
        };
        let period = min_interval.max(Duration::from_millis(10));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if sink.send(vec![fix]).await.is_err() {
                    return;
                }
            }
        });
        if let Some(previous) = self.location_task.lock().unwrap().replace(task) {
            previous.abort();
        }
    }

    fn stop_location_updates(&self) {
        if let Some(task) = self.location_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for TcpPlatform {
    fn drop(&mut self) {
        if let Some(task) = self.location_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn watch_device(addr: &str) -> TcpDevice {
        TcpDevice {
            id: "watch-1".into(),
            display_name: "Galaxy Watch 5".into(),
            alias: Some("UserID-7-SmartWatchID-3".into()),
            addr: addr.into(),
        }
    }

    #[tokio::test]
    async fn open_stream_dials_the_configured_address() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hello\n").await.unwrap();
        });

        let platform = TcpPlatform::new(vec![watch_device(&addr)], None, None);
        let mut stream = platform.open_stream("watch-1").await.unwrap();
        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\n");
    }

    #[tokio::test]
    async fn unknown_devices_are_rejected() {
        let platform = TcpPlatform::new(vec![], None, None);
        let err = platform.open_stream("nope").await.unwrap_err();
        assert!(matches!(err, PlatformError::UnknownDevice(_)));
    }

    #[tokio::test]
    async fn location_updates_replay_the_fixed_coordinate() {
        let fix = LocationFix {
            lat: 48.85,
            lon: 2.35,
            accuracy_m: 5.0,
        };
        let platform = TcpPlatform::new(vec![], None, Some(fix));
        let (tx, mut rx) = mpsc::channel(4);
        platform.start_location_updates(Duration::from_millis(10), tx);
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch, vec![fix]);
        platform.stop_location_updates();
    }
}
