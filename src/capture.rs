//! Capture resources
//!
//! Camera and screen capture are owned by the platform codec. This module
//! only tracks their lifecycle: a [`CapturePool`] opens the device lazily on
//! the first lease, shares that one instance with every concurrent session,
//! and releases it exactly once when the last lease goes away.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::error::CaptureError;
use crate::util::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureKind {
    Camera,
    Screen,
}

impl fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureKind::Camera => f.write_str("camera"),
            CaptureKind::Screen => f.write_str("screen"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A local media track offered to peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// An open capture: one video source+track and optionally an audio
/// source+track, grouped under one stream id.
#[derive(Debug, PartialEq, Eq)]
pub struct CaptureResource {
    pub kind: CaptureKind,
    pub stream_id: String,
    pub video: LocalTrack,
    pub audio: Option<LocalTrack>,
}

impl CaptureResource {
    pub fn tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        std::iter::once(&self.video).chain(self.audio.as_ref())
    }
}

/// Capture hardware as seen by the signaling layer.
pub trait CaptureDevice: Send + Sync {
    fn open(&self, kind: CaptureKind) -> Result<CaptureResource, CaptureError>;

    /// Stop capturing and dispose of sources and tracks.
    fn release(&self, resource: &CaptureResource);
}

/// Capture parameters requested from the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub audio: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            audio: false,
        }
    }
}

/// Declares tracks to the negotiation engine; the frames themselves are
/// pushed by the platform codec.
#[derive(Debug, Clone, Default)]
pub struct DeclaredCapture {
    settings: CaptureSettings,
}

impl DeclaredCapture {
    pub fn new(settings: CaptureSettings) -> Self {
        Self { settings }
    }
}

impl CaptureDevice for DeclaredCapture {
    fn open(&self, kind: CaptureKind) -> Result<CaptureResource, CaptureError> {
        let s = &self.settings;
        if s.width == 0 || s.height == 0 || s.fps == 0 {
            return Err(CaptureError::Device(format!(
                "unsupported {kind} format {}x{}@{}",
                s.width, s.height, s.fps
            )));
        }
        info!(%kind, width = s.width, height = s.height, fps = s.fps, "starting capture");
        Ok(CaptureResource {
            kind,
            stream_id: format!("{kind}-{}", uuid::Uuid::new_v4()),
            video: LocalTrack {
                id: "videoTrack".to_string(),
                kind: TrackKind::Video,
            },
            audio: s.audio.then(|| LocalTrack {
                id: "audioTrack".to_string(),
                kind: TrackKind::Audio,
            }),
        })
    }

    fn release(&self, resource: &CaptureResource) {
        info!(kind = %resource.kind, stream = %resource.stream_id, "capture released");
    }
}

#[derive(Default)]
struct PoolState {
    resource: Option<Arc<CaptureResource>>,
    leases: usize,
}

/// Shares one capture instance of a given kind between sessions.
pub struct CapturePool {
    device: Arc<dyn CaptureDevice>,
    kind: CaptureKind,
    state: Mutex<PoolState>,
}

impl CapturePool {
    pub fn new(device: Arc<dyn CaptureDevice>, kind: CaptureKind) -> Arc<Self> {
        Arc::new(Self {
            device,
            kind,
            state: Mutex::new(PoolState::default()),
        })
    }

    /// Lease the capture, opening the device if nobody holds it yet.
    pub fn acquire(self: &Arc<Self>) -> Result<CaptureLease, CaptureError> {
        let mut state = lock(&self.state);
        let resource = match &state.resource {
            Some(resource) => {
                debug!(kind = %self.kind, leases = state.leases, "reusing capture");
                resource.clone()
            }
            None => {
                let resource = Arc::new(self.device.open(self.kind)?);
                state.resource = Some(resource.clone());
                resource
            }
        };
        state.leases += 1;

        Ok(CaptureLease {
            pool: self.clone(),
            resource,
            released: false,
        })
    }

    pub fn active_leases(&self) -> usize {
        lock(&self.state).leases
    }

    pub fn is_active(&self) -> bool {
        lock(&self.state).resource.is_some()
    }

    fn release_one(&self) {
        let mut state = lock(&self.state);
        state.leases = state.leases.saturating_sub(1);
        if state.leases > 0 {
            return;
        }
        if let Some(resource) = state.resource.take() {
            self.device.release(&resource);
        }
    }
}

/// A session's claim on a shared capture. Releasing twice is a no-op, and
/// dropping an unreleased lease releases it.
pub struct CaptureLease {
    pool: Arc<CapturePool>,
    resource: Arc<CaptureResource>,
    released: bool,
}

impl CaptureLease {
    pub fn resource(&self) -> &Arc<CaptureResource> {
        &self.resource
    }

    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release_one();
        }
    }
}

impl Drop for CaptureLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for CaptureLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureLease")
            .field("stream", &self.resource.stream_id)
            .field("released", &self.released)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::CountingDevice;
    use super::*;

    #[test]
    fn concurrent_leases_share_one_instance() {
        let device = Arc::new(CountingDevice::default());
        let pool = CapturePool::new(device.clone(), CaptureKind::Camera);

        let mut a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(Arc::ptr_eq(a.resource(), b.resource()));
        assert_eq!(device.opened(), 1);
        assert_eq!(pool.active_leases(), 2);

        a.release();
        a.release();
        assert_eq!(device.released(), 0);
        assert_eq!(pool.active_leases(), 1);

        drop(a);
        drop(b);
        assert_eq!(device.released(), 1);
        assert!(!pool.is_active());
    }

    #[test]
    fn a_new_cycle_reopens_the_device() {
        let device = Arc::new(CountingDevice::default());
        let pool = CapturePool::new(device.clone(), CaptureKind::Screen);

        drop(pool.acquire().unwrap());
        let lease = pool.acquire().unwrap();
        assert_eq!(lease.resource().stream_id, "screen-1");
        drop(lease);

        assert_eq!(device.opened(), 2);
        assert_eq!(device.released(), 2);
    }

    #[test]
    fn declared_capture_adds_audio_on_request() {
        let device = DeclaredCapture::new(CaptureSettings {
            audio: true,
            ..Default::default()
        });
        let resource = device.open(CaptureKind::Camera).unwrap();
        let kinds: Vec<_> = resource.tracks().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TrackKind::Video, TrackKind::Audio]);
        assert!(resource.stream_id.starts_with("camera-"));
    }

    #[test]
    fn unusable_format_fails_and_leaves_the_pool_idle() {
        let device = Arc::new(DeclaredCapture::new(CaptureSettings {
            fps: 0,
            ..Default::default()
        }));
        let pool = CapturePool::new(device, CaptureKind::Camera);

        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, CaptureError::Device(_)));
        assert!(err.to_string().contains("640x480@0"), "{err}");
        assert_eq!(pool.active_leases(), 0);
        assert!(!pool.is_active());
    }
}
