//! The playback session: the single "current track" and its lifecycle.
//!
//! `Idle -> Loading -> Playing <-> Paused -> Idle`, with `stop` (or a failure) returning to
//! `Idle` from anywhere. Loading (resolve, fetch, transcode, open) runs on a worker thread; a
//! separate ticker thread samples the position and detects the end of the track.
//!
//! Every transition bumps a generation counter under the session lock. Workers remember the
//! generation they were started for and give up (releasing what they hold) as soon as it no
//! longer matches, so a `stop` issued mid-load always wins over a late result. The scratch files
//! of a load are shared with the session, and `stop` deletes them before it returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, select};
use jukebox_types::{
    PlaybackEndReason, PlaybackInfo, SessionEvent, SessionState, TrackMetadata, TrackRequest,
};

use crate::config::SessionSettings;
use crate::error::{LoadError, StateError, TranscodeError};
use crate::fetch::Fetcher;
use crate::output::{AudioOutput, PlaybackHandle};
use crate::resolver::Resolver;
use crate::scratch::ScratchSet;
use crate::transcode::Transcoder;

/// The pipeline stages a session drives.
#[derive(Clone)]
pub struct Components {
    pub resolver: Arc<dyn Resolver>,
    pub fetcher: Arc<dyn Fetcher>,
    pub transcoder: Arc<dyn Transcoder>,
    pub output: Arc<dyn AudioOutput>,
}

/// Cloneable handle to the session. All clones drive the same state.
#[derive(Clone)]
pub struct PlaybackSession {
    shared: Arc<Shared>,
}

struct Shared {
    components: Components,
    settings: SessionSettings,
    events: Sender<SessionEvent>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    state: SessionState,
    generation: u64,
    metadata: Option<TrackMetadata>,
    loading: Option<LoadingJob>,
    active: Option<Active>,
}

/// What the session holds on to while a worker is loading.
struct LoadingJob {
    /// Raising it makes the worker give up at its next checkpoint.
    cancel: Arc<AtomicBool>,
    /// Shared with the worker so `stop` can delete partial files without waiting for it.
    scratch: Arc<ScratchSet>,
}

/// Resources of a track that reached Playing.
struct Active {
    resources: Resources,
    duration_ms: u64,
    position_ms: u64,
    started_at: Instant,
    /// Dropping this wakes the ticker and makes it exit.
    ticker_stop: Sender<()>,
}

/// Everything a track owns on disk and on the device.
struct Resources {
    handle: Option<Box<dyn PlaybackHandle>>,
    scratch: Arc<ScratchSet>,
}

impl Resources {
    /// The one release routine: stop, natural end, failed and abandoned loads all end here.
    fn release(self) {
        if let Some(handle) = self.handle {
            handle.release();
        }
        let removed = self.scratch.release();
        tracing::debug!(removed, "track resources released");
    }
}

struct Loaded {
    metadata: TrackMetadata,
    handle: Box<dyn PlaybackHandle>,
}

enum TickOutcome {
    Continue,
    Finished,
    Stale,
}

impl PlaybackSession {
    /// Create an idle session. Events are published on the returned receiver.
    pub fn new(components: Components, settings: SessionSettings) -> (Self, Receiver<SessionEvent>) {
        let (events, rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            components,
            settings,
            events,
            inner: Mutex::new(Inner::default()),
        });
        (Self { shared }, rx)
    }

    /// Begin loading `request`. Rejected unless the session is idle.
    ///
    /// Returns as soon as the session is in `Loading`. Every outcome after that, including a
    /// loader thread that could not be spawned, arrives only as a [`SessionEvent::Failed`] or
    /// [`SessionEvent::Started`] event.
    pub fn start(&self, request: TrackRequest) -> Result<(), StateError> {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if inner.state != SessionState::Idle {
            tracing::info!(request = request.label(), state = ?inner.state, "start rejected");
            return Err(StateError::AlreadyActive);
        }
        inner.generation += 1;
        let generation = inner.generation;
        let cancel = Arc::new(AtomicBool::new(false));
        let scratch = Arc::new(ScratchSet::new(&shared.settings.scratch_dir));
        inner.state = SessionState::Loading;
        inner.metadata = match &request {
            TrackRequest::Url(url) => Some(TrackMetadata::from_url(url)),
            TrackRequest::Keywords(_) => None,
        };
        inner.loading = Some(LoadingJob {
            cancel: cancel.clone(),
            scratch: scratch.clone(),
        });
        shared.emit(SessionEvent::Loading {
            request: request.clone(),
        });
        tracing::info!(request = request.label(), generation, "loading");

        let worker = shared.clone();
        let spawned = thread::Builder::new()
            .name("jukebox-load".into())
            .spawn(move || worker.run_load(generation, request, cancel, scratch));
        if let Err(e) = spawned {
            tracing::error!("failed to spawn loader: {e}");
            inner.state = SessionState::Idle;
            inner.metadata = None;
            inner.loading = None;
            shared.emit(SessionEvent::Failed {
                reason: format!("could not start loading: {e}"),
            });
        }
        Ok(())
    }

    /// Stop whatever is loading or playing and release every resource.
    ///
    /// Returns `false` if the session was already idle.
    pub fn stop(&self) -> bool {
        self.shared.end(None, PlaybackEndReason::Stopped)
    }

    pub fn pause(&self) -> Result<(), StateError> {
        let mut inner = self.shared.lock();
        match inner.state {
            SessionState::Playing => {}
            SessionState::Paused => return Ok(()),
            SessionState::Loading => return Err(StateError::Loading),
            SessionState::Idle | SessionState::Stopping => return Err(StateError::NothingPlaying),
        }
        if let Some(active) = inner.active.as_mut() {
            if let Some(handle) = active.resources.handle.as_ref() {
                handle.pause();
                active.position_ms = active.position_ms.max(handle.position_ms());
            }
        }
        inner.state = SessionState::Paused;
        self.shared.emit(SessionEvent::Paused);
        tracing::info!("paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), StateError> {
        let mut inner = self.shared.lock();
        match inner.state {
            SessionState::Paused => {}
            SessionState::Playing => return Ok(()),
            SessionState::Loading => return Err(StateError::Loading),
            SessionState::Idle | SessionState::Stopping => return Err(StateError::NothingPlaying),
        }
        if let Some(handle) = inner.active.as_ref().and_then(|a| a.resources.handle.as_ref()) {
            handle.play();
        }
        inner.state = SessionState::Playing;
        self.shared.emit(SessionEvent::Resumed);
        tracing::info!("resumed");
        Ok(())
    }

    /// Pause when playing, resume when paused. Returns the new state.
    pub fn toggle_pause(&self) -> Result<SessionState, StateError> {
        match self.state() {
            SessionState::Playing => self.pause().map(|()| SessionState::Paused),
            SessionState::Paused => self.resume().map(|()| SessionState::Playing),
            SessionState::Loading => Err(StateError::Loading),
            SessionState::Idle | SessionState::Stopping => Err(StateError::NothingPlaying),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    /// Snapshot of the current track. Fails with `NothingPlaying` when idle.
    pub fn info(&self) -> Result<PlaybackInfo, StateError> {
        let inner = self.shared.lock();
        if !inner.state.is_active() {
            return Err(StateError::NothingPlaying);
        }
        let (position_ms, duration_ms) = match inner.active.as_ref() {
            Some(active) => {
                let live = active
                    .resources
                    .handle
                    .as_ref()
                    .map_or(0, |h| h.position_ms());
                (
                    active.position_ms.max(live).min(active.duration_ms),
                    active.duration_ms,
                )
            }
            None => (0, 0),
        };
        let metadata = inner.metadata.as_ref();
        Ok(PlaybackInfo {
            state: inner.state,
            title: metadata.and_then(|m| m.title.clone()),
            artist: metadata.and_then(|m| m.artist.clone()),
            position_ms,
            duration_ms,
        })
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("no event listener");
        }
    }

    fn run_load(
        self: Arc<Self>,
        generation: u64,
        request: TrackRequest,
        cancel: Arc<AtomicBool>,
        scratch: Arc<ScratchSet>,
    ) {
        let outcome = self.load(generation, &request, &cancel, &scratch);

        match outcome {
            Ok(loaded) => self.install(generation, loaded, scratch),
            Err(err) => {
                Resources {
                    handle: None,
                    scratch,
                }
                .release();
                let mut inner = self.lock();
                if inner.generation != generation || inner.state != SessionState::Loading {
                    tracing::debug!(request = request.label(), "abandoned load finished: {err}");
                    return;
                }
                inner.state = SessionState::Idle;
                inner.metadata = None;
                inner.loading = None;
                self.emit(SessionEvent::Failed {
                    reason: err.to_string(),
                });
                tracing::warn!(request = request.label(), error = %err, "load failed");
            }
        }
    }

    fn load(
        &self,
        generation: u64,
        request: &TrackRequest,
        cancel: &AtomicBool,
        scratch: &ScratchSet,
    ) -> Result<Loaded, LoadError> {
        let metadata = match request {
            TrackRequest::Url(url) => TrackMetadata::from_url(url),
            TrackRequest::Keywords(keywords) => {
                let found = self
                    .components
                    .resolver
                    .resolve(keywords)?
                    .ok_or_else(|| LoadError::NotFound(keywords.clone()))?;
                checkpoint(cancel)?;
                self.publish_resolved(generation, &found);
                found
            }
        };

        let input = self
            .components
            .fetcher
            .fetch(&metadata.source_url, scratch, cancel)?;
        checkpoint(cancel)?;
        let canonical = self.components.transcoder.transcode(&input, scratch, cancel)?;
        checkpoint(cancel)?;

        let handle = self.components.output.open(&canonical)?;
        if handle.duration_ms() == 0 {
            handle.release();
            return Err(TranscodeError::UnsupportedFormat("track has no audio frames".into()).into());
        }
        Ok(Loaded { metadata, handle })
    }

    fn publish_resolved(&self, generation: u64, metadata: &TrackMetadata) {
        let mut inner = self.lock();
        if inner.generation == generation && inner.state == SessionState::Loading {
            inner.metadata = Some(metadata.clone());
            self.emit(SessionEvent::Resolved {
                metadata: metadata.clone(),
            });
            tracing::info!(track = %metadata.display_name(), url = %metadata.source_url, "resolved");
        }
    }

    /// Commit a finished load, unless it was abandoned in the meantime.
    fn install(self: &Arc<Self>, generation: u64, loaded: Loaded, scratch: Arc<ScratchSet>) {
        let Loaded { metadata, handle } = loaded;
        let mut inner = self.lock();
        if inner.generation != generation || inner.state != SessionState::Loading {
            drop(inner);
            tracing::warn!(track = %metadata.display_name(), "discarding load abandoned by stop");
            Resources {
                handle: Some(handle),
                scratch,
            }
            .release();
            return;
        }

        let duration_ms = handle.duration_ms();
        handle.play();
        let (ticker_stop, stop_rx) = crossbeam_channel::bounded::<()>(0);
        inner.state = SessionState::Playing;
        inner.metadata = Some(metadata.clone());
        inner.loading = None;
        inner.active = Some(Active {
            resources: Resources {
                handle: Some(handle),
                scratch,
            },
            duration_ms,
            position_ms: 0,
            started_at: Instant::now(),
            ticker_stop,
        });
        self.emit(SessionEvent::Started {
            metadata: metadata.clone(),
            duration_ms,
        });
        tracing::info!(track = %metadata.display_name(), duration_ms, "playing");
        drop(inner);

        let weak = Arc::downgrade(self);
        let interval = self.settings.tick_interval;
        let spawned = thread::Builder::new()
            .name("jukebox-tick".into())
            .spawn(move || run_ticker(weak, generation, stop_rx, interval));
        if let Err(e) = spawned {
            tracing::error!("failed to spawn progress ticker: {e}");
            self.end(Some(generation), PlaybackEndReason::Error);
        }
    }

    fn tick(&self, generation: u64) -> TickOutcome {
        let mut inner = self.lock();
        if inner.generation != generation {
            return TickOutcome::Stale;
        }
        match inner.state {
            SessionState::Playing => {}
            SessionState::Paused => return TickOutcome::Continue,
            _ => return TickOutcome::Stale,
        }
        let epsilon = self.settings.end_epsilon_ms;
        let Some(active) = inner.active.as_mut() else {
            return TickOutcome::Stale;
        };
        let Some(handle) = active.resources.handle.as_ref() else {
            return TickOutcome::Stale;
        };
        active.position_ms = active
            .position_ms
            .max(handle.position_ms())
            .min(active.duration_ms);
        tracing::trace!(
            position_ms = active.position_ms,
            duration_ms = active.duration_ms,
            "tick"
        );
        if handle.is_finished() || active.position_ms + epsilon >= active.duration_ms {
            TickOutcome::Finished
        } else {
            TickOutcome::Continue
        }
    }

    /// Return to idle, releasing everything. `expected` restricts this to one generation.
    fn end(&self, expected: Option<u64>, reason: PlaybackEndReason) -> bool {
        let (active, loading, generation) = {
            let mut inner = self.lock();
            if expected.is_some_and(|g| g != inner.generation) {
                return false;
            }
            if !inner.state.is_active() {
                return false;
            }
            inner.generation += 1;
            let loading = inner.loading.take();
            if let Some(job) = loading.as_ref() {
                job.cancel.store(true, Ordering::SeqCst);
            }
            inner.state = SessionState::Stopping;
            (inner.active.take(), loading, inner.generation)
        };

        if let Some(job) = loading {
            let removed = job.scratch.release();
            tracing::debug!(removed, "partial load released");
        }

        if let Some(active) = active {
            let Active {
                resources,
                position_ms,
                started_at,
                ticker_stop,
                ..
            } = active;
            drop(ticker_stop);
            resources.release();
            tracing::info!(
                ?reason,
                position_ms,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "playback ended"
            );
        } else {
            tracing::info!(?reason, "loading abandoned");
        }

        let mut inner = self.lock();
        if inner.generation == generation && inner.state == SessionState::Stopping {
            inner.state = SessionState::Idle;
            inner.metadata = None;
            self.emit(SessionEvent::Ended { reason });
        }
        true
    }
}

fn checkpoint(cancel: &AtomicBool) -> Result<(), LoadError> {
    if cancel.load(Ordering::SeqCst) {
        Err(LoadError::Cancelled)
    } else {
        Ok(())
    }
}

fn run_ticker(shared: Weak<Shared>, generation: u64, stop_rx: Receiver<()>, interval: Duration) {
    let ticker = crossbeam_channel::tick(interval);
    loop {
        select! {
            recv(stop_rx) -> _ => return,
            recv(ticker) -> _ => {}
        }
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match shared.tick(generation) {
            TickOutcome::Continue => {}
            TickOutcome::Stale => return,
            TickOutcome::Finished => {
                shared.end(Some(generation), PlaybackEndReason::Eof);
                return;
            }
        }
    }
}
