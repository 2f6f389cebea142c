use crate::config::CameraConfig;
use crate::error::DeviceError;
use crate::frame::{PixelFormat, RawFrame};
use async_trait::async_trait;
use tracing::{debug, info, warn};

#[cfg(all(feature = "camera", target_os = "linux"))]
use v4l::prelude::*;

/// A source of raw camera frames. Implementations own the underlying
/// platform device handle; closing the source releases it.
#[async_trait]
pub trait CaptureSource: Send {
    /// Grab one frame from the device.
    async fn capture_frame(&mut self) -> Result<RawFrame, DeviceError>;

    /// Stop the device and drop the underlying handle.
    fn close(&mut self);
}

/// Creates a capture source for the configured device. Injected so tests and
/// embedders can substitute their own devices.
pub type SourceFactory =
    Box<dyn Fn(&CameraConfig) -> Result<Box<dyn CaptureSource>, DeviceError> + Send + Sync>;

/// The platform-default source: V4L2 when the `camera` feature is enabled on
/// Linux, a synthetic test pattern otherwise.
pub fn default_source_factory() -> SourceFactory {
    Box::new(|config| {
        #[cfg(all(feature = "camera", target_os = "linux"))]
        {
            let source = V4lSource::open(config)?;
            Ok(Box::new(source) as Box<dyn CaptureSource>)
        }

        #[cfg(not(all(feature = "camera", target_os = "linux")))]
        {
            warn!("V4L2 capture is not available in this build, using test pattern source");
            Ok(Box::new(PatternSource::from_config(config)) as Box<dyn CaptureSource>)
        }
    })
}

/// Owns the camera acquisition lifecycle for one controller.
///
/// Release is idempotent and also runs on drop, so the device is returned on
/// every exit path, including abrupt teardown.
pub struct CameraGuard {
    config: CameraConfig,
    source: Option<Box<dyn CaptureSource>>,
}

impl CameraGuard {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            source: None,
        }
    }

    /// Acquire the platform-default capture device.
    pub fn acquire(&mut self) -> Result<(), DeviceError> {
        self.acquire_with(&default_source_factory())
    }

    /// Acquire a capture device through the given factory. A no-op when a
    /// device is already held.
    pub fn acquire_with(&mut self, factory: &SourceFactory) -> Result<(), DeviceError> {
        if self.source.is_some() {
            debug!("Camera already acquired");
            return Ok(());
        }

        let source = factory(&self.config)?;
        info!(
            "Camera acquired ({}x{}, facing: {})",
            self.config.resolution.0, self.config.resolution.1, self.config.facing_mode
        );
        self.source = Some(source);
        Ok(())
    }

    /// Whether a device is currently held.
    pub fn is_held(&self) -> bool {
        self.source.is_some()
    }

    /// Capture one raw frame from the held device.
    pub async fn capture_frame(&mut self) -> Result<RawFrame, DeviceError> {
        match self.source.as_mut() {
            Some(source) => source.capture_frame().await,
            None => Err(DeviceError::Unavailable {
                details: "no camera device held".to_string(),
            }),
        }
    }

    /// Release the held device. Idempotent; safe when nothing was acquired.
    pub fn release(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.close();
            info!("Camera released");
        }
    }
}

impl Drop for CameraGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Synthetic capture source producing a moving color gradient. Used when no
/// hardware camera is available and as the default in tests.
pub struct PatternSource {
    width: u32,
    height: u32,
    counter: u64,
}

impl PatternSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            counter: 0,
        }
    }

    pub fn from_config(config: &CameraConfig) -> Self {
        Self::new(config.resolution.0, config.resolution.1)
    }
}

#[async_trait]
impl CaptureSource for PatternSource {
    async fn capture_frame(&mut self) -> Result<RawFrame, DeviceError> {
        let frame_size = (self.width * self.height * 3) as usize;
        let mut data = vec![0u8; frame_size];

        // Fill with a simple pattern that varies per frame
        let color = (
            (self.counter % 256) as u8,
            128u8,
            (255 - self.counter % 256) as u8,
        );
        for chunk in data.chunks_mut(3) {
            chunk[0] = color.0;
            chunk[1] = color.1;
            chunk[2] = color.2;
        }

        self.counter += 1;
        Ok(RawFrame::new(data, self.width, self.height, PixelFormat::Rgb8))
    }

    fn close(&mut self) {
        debug!("Pattern source closed after {} frames", self.counter);
    }
}

/// V4L2 capture source for Linux hardware deployments.
#[cfg(all(feature = "camera", target_os = "linux"))]
pub struct V4lSource {
    device: v4l::Device,
    width: u32,
    height: u32,
}

#[cfg(all(feature = "camera", target_os = "linux"))]
impl V4lSource {
    /// Open and configure the V4L2 device for MJPEG capture.
    pub fn open(config: &CameraConfig) -> Result<Self, DeviceError> {
        let device_path = format!("/dev/video{}", config.index);
        debug!("Opening V4L2 device: {}", device_path);

        let device = v4l::Device::new(config.index as usize).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                DeviceError::PermissionDenied {
                    details: format!("{}: {}", device_path, e),
                }
            } else {
                DeviceError::Unavailable {
                    details: format!("{}: {}", device_path, e),
                }
            }
        })?;

        let mut fmt = device.format().map_err(|e| DeviceError::Unavailable {
            details: format!("Failed to get format: {}", e),
        })?;

        fmt.width = config.resolution.0;
        fmt.height = config.resolution.1;
        fmt.fourcc = v4l::FourCC::new(b"MJPG");

        let actual = device
            .set_format(&fmt)
            .map_err(|e| DeviceError::Unavailable {
                details: format!("Failed to set format: {}", e),
            })?;

        if actual.width != config.resolution.0 || actual.height != config.resolution.1 {
            warn!(
                "Camera resolution adjusted by driver: requested {}x{}, got {}x{}",
                config.resolution.0, config.resolution.1, actual.width, actual.height
            );
        }

        info!(
            "Camera configured: {}x{}, format: {:?}",
            actual.width, actual.height, actual.fourcc
        );

        Ok(Self {
            device,
            width: actual.width,
            height: actual.height,
        })
    }
}

#[cfg(all(feature = "camera", target_os = "linux"))]
#[async_trait]
impl CaptureSource for V4lSource {
    async fn capture_frame(&mut self) -> Result<RawFrame, DeviceError> {
        use v4l::buffer::Type;
        use v4l::io::mmap::Stream;
        use v4l::io::traits::CaptureStream;

        let mut stream = Stream::with_buffers(&self.device, Type::VideoCapture, 2)
            .map_err(|e| DeviceError::Capture {
                details: format!("Failed to create stream: {}", e),
            })?;

        let (buffer, _meta) = stream.next().map_err(|e| DeviceError::Capture {
            details: format!("Capture failed: {}", e),
        })?;

        Ok(RawFrame::new(
            buffer.to_vec(),
            self.width,
            self.height,
            PixelFormat::Mjpeg,
        ))
    }

    fn close(&mut self) {
        debug!("V4L2 device closed");
    }
}
