//! Remote and local media handling for a call: which stream is shown on
//! the render surface, the optional local preview, and the order in which
//! both are released.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::ViewerResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

#[async_trait]
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn is_live(&self) -> bool;
    /// Stops the track. Stopping twice is harmless.
    async fn stop(&self);

    fn packets_received(&self) -> u64 {
        0
    }
}

/// A group of tracks sharing a stream id. Clones share the same track list,
/// so a track added through one handle is visible through all of them.
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    tracks: Arc<Mutex<Vec<Arc<dyn MediaTrack>>>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn add_track(&self, track: Arc<dyn MediaTrack>) {
        let mut tracks = self.tracks.lock();
        if tracks.iter().all(|existing| existing.id() != track.id()) {
            tracks.push(track);
        }
    }

    pub fn tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.tracks.lock().clone()
    }

    pub fn live_track_count(&self) -> usize {
        self.tracks.lock().iter().filter(|track| track.is_live()).count()
    }

    pub async fn stop_all(&self) {
        for track in self.tracks() {
            track.stop().await;
        }
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.lock().len())
            .finish()
    }
}

/// One remote track arriving on the peer connection, together with the
/// streams it belongs to.
#[derive(Clone)]
pub struct TrackEvent {
    pub track: Arc<dyn MediaTrack>,
    pub streams: Vec<MediaStream>,
}

impl fmt::Debug for TrackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackEvent")
            .field("track", &self.track.id())
            .field("kind", &self.track.kind())
            .field("streams", &self.streams)
            .finish()
    }
}

/// Where a stream is displayed.
pub trait RenderSurface: Send + Sync {
    fn bind(&self, stream: &MediaStream, muted: bool);
    fn clear(&self);
    /// Id of the stream currently bound, if any.
    fn bound(&self) -> Option<String>;
}

/// Surface for headless runs: remembers the binding and logs it.
#[derive(Debug, Default)]
pub struct LoggingSurface {
    name: &'static str,
    bound: Mutex<Option<String>>,
}

impl LoggingSurface {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            bound: Mutex::new(None),
        }
    }
}

impl RenderSurface for LoggingSurface {
    fn bind(&self, stream: &MediaStream, muted: bool) {
        info!(
            surface = self.name,
            stream = stream.id(),
            tracks = stream.tracks().len(),
            muted,
            "stream bound to surface"
        );
        *self.bound.lock() = Some(stream.id().to_string());
    }

    fn clear(&self) {
        if let Some(stream) = self.bound.lock().take() {
            debug!(surface = self.name, stream = %stream, "surface cleared");
        }
    }

    fn bound(&self) -> Option<String> {
        self.bound.lock().clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub video: bool,
    pub audio: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

/// Source of the local camera/microphone stream.
#[async_trait]
pub trait LocalCapture: Send + Sync {
    async fn capture(&self, constraints: CaptureConstraints) -> ViewerResult<MediaStream>;
}

/// Capture source for hosts without devices; every request is denied.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCapture;

#[async_trait]
impl LocalCapture for NoCapture {
    async fn capture(&self, _constraints: CaptureConstraints) -> ViewerResult<MediaStream> {
        Err(crate::error::ViewerError::Capture(
            "no capture device available".into(),
        ))
    }
}

pub struct MediaSink {
    surface: Arc<dyn RenderSurface>,
    preview_surface: Option<Arc<dyn RenderSurface>>,
    remote: Option<MediaStream>,
    local: Option<MediaStream>,
}

impl MediaSink {
    pub fn new(surface: Arc<dyn RenderSurface>) -> Self {
        Self {
            surface,
            preview_surface: None,
            remote: None,
            local: None,
        }
    }

    pub fn with_preview(mut self, surface: Arc<dyn RenderSurface>) -> Self {
        self.preview_surface = Some(surface);
        self
    }

    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote.as_ref()
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local.as_ref()
    }

    /// Live tracks across the remote and preview streams.
    pub fn active_track_count(&self) -> usize {
        self.remote
            .iter()
            .chain(self.local.iter())
            .map(MediaStream::live_track_count)
            .sum()
    }

    /// Asks `capture` for a local stream and binds it muted to the preview
    /// surface. A denial only disables the preview.
    pub async fn start_preview(&mut self, capture: &dyn LocalCapture) {
        let Some(surface) = self.preview_surface.clone() else {
            debug!("no preview surface configured");
            return;
        };
        if self.local.is_some() {
            return;
        }
        match capture.capture(CaptureConstraints::default()).await {
            Ok(stream) => {
                surface.bind(&stream, true);
                self.local = Some(stream);
            }
            Err(err) => warn!(error = %err, "local preview unavailable"),
        }
    }

    /// Binds the first stream of `event` unless a remote stream is already
    /// bound. Returns whether this event produced the binding.
    pub fn on_track(&mut self, event: &TrackEvent) -> bool {
        let Some(stream) = event.streams.first() else {
            debug!(track = event.track.id(), "track arrived without a stream");
            return false;
        };
        if let Some(current) = &self.remote {
            if current.id() != stream.id() {
                debug!(
                    bound = current.id(),
                    ignored = stream.id(),
                    "remote stream already bound"
                );
            }
            return false;
        }
        self.surface.bind(stream, false);
        self.remote = Some(stream.clone());
        true
    }

    pub async fn stop_remote(&mut self) {
        if let Some(stream) = self.remote.take() {
            stream.stop_all().await;
            debug!(stream = stream.id(), "remote tracks stopped");
        }
    }

    pub fn clear_surface(&mut self) {
        if self.surface.bound().is_some() {
            self.surface.clear();
        }
    }

    pub async fn stop_preview(&mut self) {
        if let Some(stream) = self.local.take() {
            stream.stop_all().await;
            if let Some(surface) = &self.preview_surface {
                surface.clear();
            }
        }
    }
}
