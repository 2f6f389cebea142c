pub mod camera;
pub mod capture;
pub mod channel;
pub mod config;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod reconcile;
pub mod session;

pub use camera::{default_source_factory, CameraGuard, CaptureSource, PatternSource, SourceFactory};
pub use capture::CaptureLoop;
pub use channel::{
    ChannelAdapter, ChannelEvent, ChannelState, ReconnectPolicy, ScriptedChannel, WebSocketChannel,
};
pub use config::AttendcamConfig;
pub use error::{
    AttendcamError, ChannelError, DeviceError, ProcessingError, ProtocolError, Result,
};
pub use frame::{Frame, FrameEncoder, PixelFormat, RawFrame};
pub use protocol::{ClientMessage, ServerMessage};
pub use reconcile::{reconcile, Disposition, Indicator, Outcome, OutcomeKind};
pub use session::{
    ChannelFactory, Session, SessionController, SessionControllerBuilder, SessionParams,
    SessionState, StatusUpdate,
};
