//! Capture sources (the stream handle the capture loop owns).

use super::encoder::RawSnapshot;
use crate::error::CaptureError;

/// A live visual surface.
///
/// The capture loop polls `is_active` every cycle and calls `stop` exactly
/// when transmission ends; `stop` must be idempotent.
pub trait CaptureSource: Send + 'static {
    fn is_active(&self) -> bool;

    /// Current surface contents. Must return promptly.
    fn snapshot(&mut self) -> Result<RawSnapshot, CaptureError>;

    /// Release every track behind this source.
    fn stop(&mut self);
}

/// Synthetic animated gradient, for running without a display.
#[derive(Debug)]
pub struct TestPattern {
    width: u32,
    height: u32,
    produced: u64,
    limit: Option<u64>,
    stopped: bool,
}

impl TestPattern {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            produced: 0,
            limit: None,
            stopped: false,
        }
    }

    /// Go inactive after `frames` snapshots, as if the user ended the share
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    pub fn produced(&self) -> u64 {
        self.produced
    }

    fn render(&self) -> Vec<u8> {
        let shift = ((self.produced * 4) % self.width as u64) as u32;
        let mut pixels = Vec::with_capacity((self.width * self.height * 4) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                let r = (((x + shift) % self.width) * 255 / self.width) as u8;
                let g = (y * 255 / self.height) as u8;
                let b = (self.produced % 256) as u8;
                pixels.extend_from_slice(&[r, g, b, 255]);
            }
        }
        pixels
    }
}

impl CaptureSource for TestPattern {
    fn is_active(&self) -> bool {
        !self.stopped && self.limit.map_or(true, |limit| self.produced < limit)
    }

    fn snapshot(&mut self) -> Result<RawSnapshot, CaptureError> {
        if !self.is_active() {
            return Err(CaptureError::Unavailable("test pattern ended".into()));
        }
        let pixels = self.render();
        self.produced += 1;
        RawSnapshot::from_rgba(self.width, self.height, pixels)
            .map_err(|e| CaptureError::Unavailable(e.reason))
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}

#[cfg(feature = "screen")]
pub use display::DisplaySource;

#[cfg(feature = "screen")]
mod display {
    use scrap::{Capturer, Display};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tracing::{debug, warn};

    use super::CaptureSource;
    use crate::error::CaptureError;
    use crate::screen::encoder::{PixelFormat, RawSnapshot};

    /// Primary display via scrap.
    ///
    /// scrap's `Capturer` is `!Send` on X11, so it lives on its own thread
    /// and publishes the most recent surface into a shared slot.
    pub struct DisplaySource {
        running: Arc<AtomicBool>,
        alive: Arc<AtomicBool>,
        latest: Arc<Mutex<Option<RawSnapshot>>>,
    }

    impl DisplaySource {
        pub fn primary() -> Result<Self, CaptureError> {
            // Fail early if there is no display at all
            let display = Display::primary()
                .map_err(|e| CaptureError::Unavailable(format!("no display found: {}", e)))?;
            if display.width() == 0 || display.height() == 0 {
                return Err(CaptureError::Unavailable(format!(
                    "display reports an empty surface {}x{}",
                    display.width(),
                    display.height()
                )));
            }
            drop(display);

            let running = Arc::new(AtomicBool::new(true));
            let alive = Arc::new(AtomicBool::new(true));
            let latest = Arc::new(Mutex::new(None));

            let thread_running = running.clone();
            let thread_alive = alive.clone();
            let thread_latest = latest.clone();
            std::thread::spawn(move || {
                capture_thread(thread_running, thread_latest);
                thread_alive.store(false, Ordering::Relaxed);
            });

            Ok(Self {
                running,
                alive,
                latest,
            })
        }
    }

    fn capture_thread(running: Arc<AtomicBool>, latest: Arc<Mutex<Option<RawSnapshot>>>) {
        let display = match Display::primary() {
            Ok(d) => d,
            Err(e) => {
                warn!("screen capture: no display: {}", e);
                return;
            }
        };
        let w = display.width();
        let h = display.height();
        let mut capturer = match Capturer::new(display) {
            Ok(c) => c,
            Err(e) => {
                warn!("screen capture: failed to start: {}", e);
                return;
            }
        };
        debug!(width = w, height = h, "display capture started");

        while running.load(Ordering::Relaxed) {
            match capturer.frame() {
                Ok(frame) => {
                    // scrap rows may carry padding
                    match RawSnapshot::from_padded_rows(w as u32, h as u32, PixelFormat::Bgra8, frame.to_vec()) {
                        Ok(snapshot) => {
                            *latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot);
                        }
                        Err(e) => debug!("dropping malformed capture: {}", e),
                    }
                    std::thread::sleep(Duration::from_millis(8));
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => {
                    warn!("screen capture ended: {}", e);
                    break;
                }
            }
        }
    }

    impl CaptureSource for DisplaySource {
        fn is_active(&self) -> bool {
            self.running.load(Ordering::Relaxed) && self.alive.load(Ordering::Relaxed)
        }

        fn snapshot(&mut self) -> Result<RawSnapshot, CaptureError> {
            self.latest
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
                .ok_or(CaptureError::NoFrame)
        }

        fn stop(&mut self) {
            self.running.store(false, Ordering::Relaxed);
        }
    }

    impl Drop for DisplaySource {
        fn drop(&mut self) {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_limit_ends_stream() {
        let mut source = TestPattern::new(8, 4).with_limit(2);
        assert!(source.is_active());
        let snap = source.snapshot().unwrap();
        assert_eq!((snap.width(), snap.height()), (8, 4));
        assert_eq!(snap.pixels().len(), 8 * 4 * 4);
        source.snapshot().unwrap();
        assert!(!source.is_active());
        assert!(source.snapshot().is_err());
        assert_eq!(source.produced(), 2);
    }

    #[test]
    fn test_pattern_stop_is_idempotent() {
        let mut source = TestPattern::new(2, 2);
        source.stop();
        source.stop();
        assert!(!source.is_active());
    }

    #[test]
    fn test_pattern_animates() {
        let mut source = TestPattern::new(16, 2);
        let a = source.snapshot().unwrap();
        let b = source.snapshot().unwrap();
        assert_ne!(a.pixels(), b.pixels());
    }
}
