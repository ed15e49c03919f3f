//! Camera/microphone capture and fullscreen elevation.
//!
//! `PermissionManager` owns the capture stream for the whole session. Every track gets an
//! ended observer when the stream is acquired; tracks stopped by [`PermissionManager::release`]
//! never report as ended.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::lock_or_recover;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Video => "video",
            TrackKind::Audio => "audio",
        }
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

pub type TrackEndedObserver = Arc<dyn Fn(TrackKind) + Send + Sync>;

/// One live capture track.
pub trait MediaTrack: Send {
    fn kind(&self) -> TrackKind;
    fn is_live(&self) -> bool;
    /// Replaces the observer invoked when the track ends without `stop()`.
    fn on_ended(&mut self, observer: TrackEndedObserver);
    fn stop(&mut self);
}

pub struct CaptureStream {
    id: String,
    tracks: Vec<Box<dyn MediaTrack>>,
}

impl CaptureStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Box<dyn MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn has_live_track(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind() == kind && t.is_live())
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    fn stop_all(&mut self) {
        for track in &mut self.tracks {
            track.stop();
        }
    }
}

impl std::fmt::Debug for CaptureStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

/// Capture backend (`getUserMedia` in a browser host).
pub trait MediaDevices: Send {
    fn get_user_media(&mut self, constraints: &MediaConstraints) -> Result<CaptureStream>;
}

/// Live preview target.
pub trait VideoSink {
    fn attach(&mut self, stream: &CaptureStream);
}

pub struct PermissionManager {
    devices: Box<dyn MediaDevices>,
    constraints: MediaConstraints,
    stream: Option<CaptureStream>,
    released: Arc<AtomicBool>,
}

impl PermissionManager {
    pub fn new(devices: Box<dyn MediaDevices>) -> Self {
        Self::with_constraints(devices, MediaConstraints::default())
    }

    pub fn with_constraints(devices: Box<dyn MediaDevices>, constraints: MediaConstraints) -> Self {
        Self {
            devices,
            constraints,
            stream: None,
            released: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Single combined camera + microphone request.
    ///
    /// A held stream is released first. On denial nothing is held, both grants read
    /// false, and the caller decides whether the denial is a violation.
    pub fn request_permissions(&mut self, on_track_ended: TrackEndedObserver) -> bool {
        self.release();

        let mut stream = match self.devices.get_user_media(&self.constraints) {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("media capture request denied: {}", e);
                return false;
            }
        };

        let released = Arc::new(AtomicBool::new(false));
        for track in &mut stream.tracks {
            let guard = Arc::clone(&released);
            let observer = Arc::clone(&on_track_ended);
            track.on_ended(Arc::new(move |kind| {
                if !guard.load(Ordering::SeqCst) {
                    observer(kind);
                }
            }));
        }

        log::info!(
            "media capture granted (stream {}, {} tracks)",
            stream.id,
            stream.tracks.len()
        );
        self.released = released;
        self.stream = Some(stream);
        true
    }

    /// No-op (returns false) when no stream is held.
    pub fn attach_video_sink(&self, sink: &mut dyn VideoSink) -> bool {
        match &self.stream {
            Some(stream) => {
                sink.attach(stream);
                true
            }
            None => false,
        }
    }

    /// Stops every track. Safe to call repeatedly; returns whether a stream was held.
    pub fn release(&mut self) -> bool {
        self.released.store(true, Ordering::SeqCst);
        match self.stream.take() {
            Some(mut stream) => {
                stream.stop_all();
                log::debug!("media stream {} released", stream.id);
                true
            }
            None => false,
        }
    }

    pub fn is_holding_stream(&self) -> bool {
        self.stream.is_some()
    }

    /// A live video track is held.
    pub fn camera_granted(&self) -> bool {
        self.stream
            .as_ref()
            .is_some_and(|s| s.has_live_track(TrackKind::Video))
    }

    /// A live audio track is held.
    pub fn microphone_granted(&self) -> bool {
        self.stream
            .as_ref()
            .is_some_and(|s| s.has_live_track(TrackKind::Audio))
    }
}

impl Drop for PermissionManager {
    fn drop(&mut self) {
        self.release();
    }
}

/// Fullscreen backend (`requestFullscreen` on the document root).
pub trait FullscreenHost: Send {
    fn request_fullscreen(&mut self) -> Result<()>;
    fn exit_fullscreen(&mut self) -> Result<()>;
    fn is_fullscreen(&self) -> bool;
}

pub struct FullscreenController {
    host: Box<dyn FullscreenHost>,
    expected_exit: Arc<AtomicBool>,
}

impl FullscreenController {
    pub fn new(host: Box<dyn FullscreenHost>) -> Self {
        Self {
            host,
            expected_exit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Failure is reported, never raised.
    pub fn enter(&mut self) -> bool {
        match self.host.request_fullscreen() {
            Ok(()) => {
                self.expected_exit.store(false, Ordering::SeqCst);
                true
            }
            Err(e) => {
                log::warn!("fullscreen request failed: {}", e);
                false
            }
        }
    }

    /// Controller-initiated exit. The next fullscreen-lost signal is expected and
    /// must not be counted.
    pub fn exit(&mut self) {
        if !self.host.is_fullscreen() {
            return;
        }
        self.expected_exit.store(true, Ordering::SeqCst);
        if let Err(e) = self.host.exit_fullscreen() {
            self.expected_exit.store(false, Ordering::SeqCst);
            log::warn!("fullscreen exit failed: {}", e);
        }
    }

    pub fn is_fullscreen(&self) -> bool {
        self.host.is_fullscreen()
    }

    /// Shared with the signal route, which consumes it with `swap(false)`.
    pub fn expected_exit_marker(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.expected_exit)
    }
}

// -------------------- Synthetic Hosts --------------------

struct SyntheticTrackState {
    live: bool,
    observer: Option<TrackEndedObserver>,
}

struct SyntheticTrack {
    kind: TrackKind,
    state: Arc<Mutex<SyntheticTrackState>>,
}

impl MediaTrack for SyntheticTrack {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_live(&self) -> bool {
        lock_or_recover(&self.state).live
    }

    fn on_ended(&mut self, observer: TrackEndedObserver) {
        lock_or_recover(&self.state).observer = Some(observer);
    }

    fn stop(&mut self) {
        lock_or_recover(&self.state).live = false;
    }
}

#[derive(Default)]
struct SyntheticMediaState {
    deny_reason: Option<String>,
    requests: u32,
    tracks: Vec<(TrackKind, Arc<Mutex<SyntheticTrackState>>)>,
}

/// In-process capture backend. Clones share state, so a test keeps one handle to end
/// tracks while the controller owns the other.
#[derive(Clone, Default)]
pub struct SyntheticMediaDevices {
    state: Arc<Mutex<SyntheticMediaState>>,
}

impl SyntheticMediaDevices {
    pub fn granting() -> Self {
        Self::default()
    }

    pub fn denying(reason: &str) -> Self {
        let devices = Self::default();
        devices.deny(reason);
        devices
    }

    pub fn deny(&self, reason: &str) {
        lock_or_recover(&self.state).deny_reason = Some(reason.to_string());
    }

    pub fn grant(&self) {
        lock_or_recover(&self.state).deny_reason = None;
    }

    pub fn request_count(&self) -> u32 {
        lock_or_recover(&self.state).requests
    }

    pub fn live_tracks(&self) -> usize {
        lock_or_recover(&self.state)
            .tracks
            .iter()
            .filter(|(_, t)| lock_or_recover(t).live)
            .count()
    }

    /// Ends every live track of `kind` as if the device went away. Returns how many ended.
    pub fn end_track(&self, kind: TrackKind) -> usize {
        let observers: Vec<Option<TrackEndedObserver>> = {
            let state = lock_or_recover(&self.state);
            state
                .tracks
                .iter()
                .filter(|(k, _)| *k == kind)
                .filter_map(|(_, track)| {
                    let mut track = lock_or_recover(track);
                    if !track.live {
                        return None;
                    }
                    track.live = false;
                    Some(track.observer.clone())
                })
                .collect()
        };
        let ended = observers.len();
        for observer in observers.into_iter().flatten() {
            observer(kind);
        }
        ended
    }
}

impl MediaDevices for SyntheticMediaDevices {
    fn get_user_media(&mut self, constraints: &MediaConstraints) -> Result<CaptureStream> {
        let mut state = lock_or_recover(&self.state);
        state.requests += 1;
        if let Some(reason) = &state.deny_reason {
            return Err(anyhow!("NotAllowedError: {}", reason));
        }
        if !constraints.video && !constraints.audio {
            return Err(anyhow!("TypeError: at least one of audio or video is required"));
        }

        let mut tracks: Vec<Box<dyn MediaTrack>> = Vec::new();
        for (wanted, kind) in [
            (constraints.video, TrackKind::Video),
            (constraints.audio, TrackKind::Audio),
        ] {
            if !wanted {
                continue;
            }
            let track_state = Arc::new(Mutex::new(SyntheticTrackState {
                live: true,
                observer: None,
            }));
            state.tracks.push((kind, Arc::clone(&track_state)));
            tracks.push(Box::new(SyntheticTrack {
                kind,
                state: track_state,
            }));
        }
        Ok(CaptureStream::new(
            format!("synthetic-{}", state.requests),
            tracks,
        ))
    }
}

struct SyntheticFullscreenState {
    supported: bool,
    deny: bool,
    active: bool,
    requests: u32,
}

/// In-process fullscreen backend. Clones share state.
#[derive(Clone)]
pub struct SyntheticFullscreenHost {
    state: Arc<Mutex<SyntheticFullscreenState>>,
}

impl Default for SyntheticFullscreenHost {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(SyntheticFullscreenState {
                supported: true,
                deny: false,
                active: false,
                requests: 0,
            })),
        }
    }
}

impl SyntheticFullscreenHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unsupported() -> Self {
        let host = Self::default();
        lock_or_recover(&host.state).supported = false;
        host
    }

    pub fn set_deny(&self, deny: bool) {
        lock_or_recover(&self.state).deny = deny;
    }

    /// User-initiated exit (Esc). The matching signal is fired by the caller.
    pub fn leave(&self) {
        lock_or_recover(&self.state).active = false;
    }

    pub fn request_count(&self) -> u32 {
        lock_or_recover(&self.state).requests
    }
}

impl FullscreenHost for SyntheticFullscreenHost {
    fn request_fullscreen(&mut self) -> Result<()> {
        let mut state = lock_or_recover(&self.state);
        state.requests += 1;
        if !state.supported {
            return Err(anyhow!("fullscreen is not supported"));
        }
        if state.deny {
            return Err(anyhow!("fullscreen request denied"));
        }
        state.active = true;
        Ok(())
    }

    fn exit_fullscreen(&mut self) -> Result<()> {
        lock_or_recover(&self.state).active = false;
        Ok(())
    }

    fn is_fullscreen(&self) -> bool {
        lock_or_recover(&self.state).active
    }
}
