use crate::camera::CameraGuard;
use crate::config::CaptureConfig;
use crate::error::Result;
use crate::frame::{Frame, FrameEncoder};
use chrono::Utc;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::trace;

/// Produces at most one encoded frame per tick.
///
/// Single-flight is enforced by the session task structure: the tick ticker
/// is not polled while a capture+encode+send is in flight, and
/// [`MissedTickBehavior::Skip`] discards the ticks that fired meanwhile.
/// Dropping frames under load is the intended backpressure, not a defect.
pub struct CaptureLoop {
    encoder: FrameEncoder,
    tick: Duration,
    sequence: u64,
}

impl CaptureLoop {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            encoder: FrameEncoder::new(config.jpeg_quality),
            tick: Duration::from_millis(config.interval_ms),
            sequence: 0,
        }
    }

    /// Ticker for the capture cadence. Ticks that fire while a capture is in
    /// flight are skipped, never queued.
    pub fn ticker(&self) -> Interval {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    }

    /// Capture cadence.
    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Capture and encode the next frame, assigning the next sequence number.
    pub async fn produce(&mut self, guard: &mut CameraGuard) -> Result<Frame> {
        let raw = guard.capture_frame().await?;
        let image = self.encoder.encode(&raw)?;

        let frame = Frame {
            sequence: self.sequence,
            image,
            captured_at: Utc::now(),
        };
        self.sequence += 1;

        trace!(
            "Captured frame {} ({}x{}, {} bytes encoded)",
            frame.sequence,
            raw.width,
            raw.height,
            frame.image.len()
        );

        Ok(frame)
    }

    /// Frames produced so far; also the next sequence number.
    pub fn frames_produced(&self) -> u64 {
        self.sequence
    }
}
