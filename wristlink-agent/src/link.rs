//! Device link: owns the persistent byte-stream to the companion device
//!
//! State machine: Disconnected -> Connecting -> Connected -> Failed, with
//! `connect` as the only way out of Failed. The link never retries on its
//! own; reconnecting is the orchestrator's job. The read loop runs on its
//! own task and reports everything upward through an event channel; events
//! carry the connection attempt id so late arrivals from a superseded
//! attempt can be ignored.

use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::platform::{PermissionKind, Platform, PlatformError};
use crate::protocol::{self, DecodeError, IdentityHints, MonitoringMode, Reading};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("missing permission to reach the device")]
    PermissionDenied,
    #[error("transport error: {0}")]
    Transport(String),
}

/// Raised by the read loop, marshalled onto the orchestrator's control
/// loop through the event channel.
#[derive(Debug)]
pub struct LinkEvent {
    /// Connection attempt this event belongs to.
    pub attempt: u64,
    pub kind: LinkEventKind,
}

#[derive(Debug)]
pub enum LinkEventKind {
    /// A valid decoded reading.
    Reading(Reading),
    /// A line that failed to decode. Non-fatal, the stream continues.
    Decode { error: DecodeError, line: String },
    /// End of stream or I/O error. Fatal for this session.
    Closed { error: Option<String> },
}

pub struct DeviceLink<P: Platform> {
    platform: Arc<P>,
    events: mpsc::Sender<LinkEvent>,
    state: ConnectionState,
    attempt: u64,
    device_id: Option<String>,
    writer: Option<WriteHalf<P::Stream>>,
    reader_task: Option<JoinHandle<()>>,
}

impl<P: Platform> DeviceLink<P> {
    pub fn new(platform: Arc<P>, events: mpsc::Sender<LinkEvent>) -> Self {
        Self {
            platform,
            events,
            state: ConnectionState::Disconnected,
            attempt: 0,
            device_id: None,
            writer: None,
            reader_task: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Current connection attempt id; events from earlier attempts are stale.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// Open the byte-stream, announce the monitoring mode, start the read
    /// loop. A failure to write the announcement is a connect failure, not
    /// a post-connect failure.
    pub async fn connect(&mut self, device_id: &str, mode: MonitoringMode) -> Result<(), LinkError> {
        self.teardown_session();

        if !self.platform.has_permission(PermissionKind::DeviceConnect) {
            error!("missing device-connect permission");
            self.state = ConnectionState::Failed;
            return Err(LinkError::PermissionDenied);
        }

        self.attempt += 1;
        self.state = ConnectionState::Connecting;
        debug!(%device_id, attempt = self.attempt, "opening device stream");

        let stream = match self.platform.open_stream(device_id).await {
            Ok(stream) => stream,
            Err(PlatformError::PermissionDenied(kind)) => {
                error!(?kind, "device stream refused: permission missing");
                self.state = ConnectionState::Failed;
                return Err(LinkError::PermissionDenied);
            }
            Err(err) => {
                error!(%err, "failed to open device stream");
                self.state = ConnectionState::Failed;
                return Err(LinkError::Transport(err.to_string()));
            }
        };

        let (read_half, mut write_half) = tokio::io::split(stream);

        let announcement = protocol::encode_mode_announcement(mode);
        if let Err(err) = write_half.write_all(announcement.as_bytes()).await {
            error!(%err, "failed to announce monitoring mode");
            self.state = ConnectionState::Failed;
            return Err(LinkError::Transport(err.to_string()));
        }
        if let Err(err) = write_half.flush().await {
            error!(%err, "failed to flush mode announcement");
            self.state = ConnectionState::Failed;
            return Err(LinkError::Transport(err.to_string()));
        }

        let hints = IdentityHints {
            system_name: self.platform.system_device_name(),
            device_alias: self.platform.device_alias(device_id),
        };
        self.reader_task = Some(tokio::spawn(read_loop(
            read_half,
            self.attempt,
            self.events.clone(),
            hints,
        )));
        self.writer = Some(write_half);
        self.device_id = Some(device_id.to_string());
        self.state = ConnectionState::Connected;
        info!(%device_id, mode = %mode, "device link connected");
        Ok(())
    }

    /// Write one protocol line. Valid only while Connected; otherwise a
    /// logged no-op, because the caller may race a send against an async
    /// disconnect. Returns whether the line was written.
    pub async fn send_line(&mut self, line: &str) -> bool {
        if self.state != ConnectionState::Connected {
            warn!(state = ?self.state, "send ignored: device link not connected");
            return false;
        }
        let Some(writer) = self.writer.as_mut() else {
            warn!("send ignored: no writer");
            return false;
        };
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        match result {
            Ok(()) => {
                debug!(line = line.trim_end(), "sent to device");
                true
            }
            Err(err) => {
                // The read loop will surface the broken stream shortly.
                error!(%err, "failed to write to device");
                false
            }
        }
    }

    /// Record that the session is gone. Only `connect` leads out of Failed.
    pub fn mark_failed(&mut self) {
        self.state = ConnectionState::Failed;
        self.writer = None;
    }

    pub fn disconnect(&mut self) {
        self.teardown_session();
        self.state = ConnectionState::Disconnected;
        info!("device link closed");
    }

    fn teardown_session(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.writer = None;
        self.device_id = None;
    }
}

async fn read_loop<R>(
    reader: ReadHalf<R>,
    attempt: u64,
    events: mpsc::Sender<LinkEvent>,
    hints: IdentityHints,
) where
    R: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let event = match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                debug!(%line, "received from device");
                match protocol::decode_line(&line, &hints) {
                    Ok(reading) => LinkEventKind::Reading(reading),
                    Err(error) => {
                        warn!(%error, %line, "undecodable line dropped");
                        LinkEventKind::Decode { error, line }
                    }
                }
            }
            Ok(None) => {
                warn!("device stream ended");
                let _ = events.send(LinkEvent { attempt, kind: LinkEventKind::Closed { error: None } }).await;
                return;
            }
            Err(err) => {
                error!(%err, "device stream read failed");
                let _ = events
                    .send(LinkEvent {
                        attempt,
                        kind: LinkEventKind::Closed { error: Some(err.to_string()) },
                    })
                    .await;
                return;
            }
        };
        if events.send(LinkEvent { attempt, kind: event }).await.is_err() {
            // Orchestrator is gone, nothing left to report to.
            return;
        }
    }
}
