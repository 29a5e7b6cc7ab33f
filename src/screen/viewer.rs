//! Viewer side: decode received payloads and hand them to a display.
//!
//! Frames carry no header. Each payload stands alone and its size is
//! whatever the decoded image says, so the viewer never assumes a fixed
//! rate or resolution.

use bytes::Bytes;
use image::{DynamicImage, ImageFormat};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::{ConnectionStatus, FrameReceiver};
use crate::error::DecodeError;

/// A received payload, decoded for display
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub image: DynamicImage,
    /// The payload exactly as it came off the wire
    pub payload: Bytes,
}

impl DecodedFrame {
    pub fn decode(payload: impl Into<Bytes>) -> Result<Self, DecodeError> {
        let payload = payload.into();
        if payload.is_empty() {
            return Err(DecodeError::Empty);
        }
        let image = image::load_from_memory_with_format(&payload, ImageFormat::Jpeg)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        Ok(Self {
            width: image.width(),
            height: image.height(),
            image,
            payload,
        })
    }
}

/// The presentation layer a viewer drives
pub trait FrameDisplay {
    /// Replace whatever is on screen with `frame`
    fn present(&mut self, frame: DecodedFrame);

    fn status_changed(&mut self, _status: ConnectionStatus) {}
}

/// What the viewer knows about its session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerState {
    pub status: ConnectionStatus,
    /// Size of the frame currently displayed
    pub frame_size: Option<(u32, u32)>,
    pub frames_shown: u64,
    pub undecodable: u64,
}

impl Default for ViewerState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            frame_size: None,
            frames_shown: 0,
            undecodable: 0,
        }
    }
}

/// Drive `display` until the frame stream ends.
///
/// Status changes are forwarded as they arrive; frames are presented in
/// receipt order. Returns the final state.
pub async fn run_viewer<D: FrameDisplay>(
    mut frames: FrameReceiver,
    mut status_rx: mpsc::UnboundedReceiver<ConnectionStatus>,
    initial: ConnectionStatus,
    display: &mut D,
) -> ViewerState {
    let mut state = ViewerState {
        status: initial,
        ..ViewerState::default()
    };
    display.status_changed(initial);
    let mut status_open = true;

    loop {
        tokio::select! {
            // Apply status updates before frames that arrived after them
            biased;
            status = status_rx.recv(), if status_open => match status {
                Some(status) => {
                    state.status = status;
                    display.status_changed(status);
                }
                None => status_open = false,
            },
            payload = frames.next() => match payload {
                Some(payload) => show(payload, &mut state, display),
                None => break,
            },
        }
    }

    // Transitions that raced the end of the stream
    while let Ok(status) = status_rx.try_recv() {
        state.status = status;
        display.status_changed(status);
    }
    state
}

fn show<D: FrameDisplay>(payload: Bytes, state: &mut ViewerState, display: &mut D) {
    let len = payload.len();
    match DecodedFrame::decode(payload) {
        Ok(frame) => {
            let size = (frame.width, frame.height);
            if state.frame_size != Some(size) {
                debug!(width = size.0, height = size.1, "frame size changed");
            }
            state.frame_size = Some(size);
            state.frames_shown += 1;
            display.present(frame);
        }
        Err(e) => {
            state.undecodable += 1;
            warn!("skipping undecodable frame ({} bytes): {}", len, e);
        }
    }
}

/// Keeps the latest frame on disk, overwriting the previous one.
pub struct SnapshotFileDisplay {
    path: PathBuf,
    last_size: Option<(u32, u32)>,
}

impl SnapshotFileDisplay {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_size: None,
        }
    }
}

impl FrameDisplay for SnapshotFileDisplay {
    fn present(&mut self, frame: DecodedFrame) {
        let size = (frame.width, frame.height);
        if self.last_size != Some(size) {
            info!("🖥️  Receiving {}x{} frames", size.0, size.1);
            self.last_size = Some(size);
        }
        // Write then rename so readers never see a half-written frame
        let tmp = self.path.with_extension("part");
        let written = std::fs::write(&tmp, &frame.payload)
            .and_then(|_| std::fs::rename(&tmp, &self.path));
        if let Err(e) = written {
            warn!("failed to write {}: {}", self.path.display(), e);
        }
    }

    fn status_changed(&mut self, status: ConnectionStatus) {
        info!("viewer status: {}", status);
    }
}
