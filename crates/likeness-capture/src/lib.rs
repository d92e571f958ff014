//! likeness-capture: the capture side of a registration attempt.
//!
//! A [`CaptureSession`] owns one media device, records continuously and
//! takes a single still frame. The [`LocationResolver`] and
//! [`DeviceFingerprint`] supply the out-of-band context that travels with it.

pub mod device;
pub mod fingerprint;
pub mod frame;
pub mod geocode;
pub mod location;
pub mod recorder;
pub mod session;

pub use device::{CaptureError, MediaDevice, ReplayDevice, ReplayFeed};
pub use fingerprint::DeviceFingerprint;
pub use frame::{StillFrame, VideoArtifact};
pub use location::{LocationError, LocationResolver, LocationSource, Resolution};
pub use recorder::{RecorderHandle, DEFAULT_MAX_VIDEO_BYTES};
pub use session::{CaptureSession, RecordingState};
