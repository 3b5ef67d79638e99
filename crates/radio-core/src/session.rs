//! PlaybackSession: single-stream playback state machine.
//!
//! ```text
//!   Idle ──select──▶ Focusing ──granted──▶ Buffering ──prepared──▶ Playing
//!                        │                     │                      │
//!                        └──denied──▶ Stopped ◀┴──error / focus lost ─┘
//!                                        ▲          stop / pause / re-select
//! ```
//!
//! The session owns the player, the audio-focus handle and the activity
//! indicator exclusively, and is driven from one serialized context.  Player
//! callbacks arrive as [`PlayerEvent`]s tagged with the [`LoadToken`] of the
//! load that produced them, so events of a torn-down stream are ignored.
//!
//! Nothing here returns an error to the caller: focus denial and player
//! faults are logged and end in `Stopped`.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::StationCatalog;
use crate::error::PlayerError;
use crate::station::StationRecord;
use crate::store::KeyValueStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Nothing selected yet, no focus held.
    #[default]
    Idle,
    /// Focus requested for a new selection.
    Focusing,
    /// Player is loading the stream.
    Buffering,
    /// Audio is audible.
    Playing,
    /// Player torn down and focus released; the selection is kept for resume.
    Stopped,
}

/// Identifies one `load` issued to the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoadToken(pub u64);

/// Callbacks from the black-box player.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// The stream is ready to start.
    Prepared { token: LoadToken },
    /// The player failed; playback must stop.
    Error { token: LoadToken, message: String },
    /// Informational (buffering, position unknown).  Logged only.
    Info { token: LoadToken, detail: String },
}

impl PlayerEvent {
    pub fn token(&self) -> LoadToken {
        match self {
            Self::Prepared { token } | Self::Error { token, .. } | Self::Info { token, .. } => {
                *token
            }
        }
    }
}

/// Platform audio-focus loss.  Every kind is handled as a full stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FocusLoss {
    Permanent,
    Transient,
    TransientCanDuck,
}

/// The black-box audio player.
///
/// `load` starts preparing a stream and reports back with
/// [`PlayerEvent::Prepared`] or [`PlayerEvent::Error`] carrying the same token.
pub trait Player {
    fn load(&mut self, token: LoadToken, url: &str) -> Result<(), PlayerError>;
    fn start(&mut self) -> Result<(), PlayerError>;
    fn stop(&mut self) -> Result<(), PlayerError>;
    /// Free the underlying resources.  Must not fail.
    fn release(&mut self);
}

/// Platform audio-focus arbitration.
pub trait AudioFocus {
    /// Returns `true` if focus was granted.
    fn request(&mut self) -> bool;
    fn abandon(&mut self);
}

/// The foreground/notification owner.
pub trait ActivityIndicator {
    fn activate(&mut self, title: &str);
    fn deactivate(&mut self);
}

/// Read access to the station list for selection.
pub trait StationLookup {
    fn lookup_station(&self, id: &str) -> Option<StationRecord>;
}

impl<S: KeyValueStore> StationLookup for StationCatalog<S> {
    fn lookup_station(&self, id: &str) -> Option<StationRecord> {
        self.lookup(id)
    }
}

impl StationLookup for [StationRecord] {
    fn lookup_station(&self, id: &str) -> Option<StationRecord> {
        self.iter().find(|s| s.id == id).cloned()
    }
}

/// Observable session state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub current_station_id: Option<String>,
    pub current_station_name: Option<String>,
    pub lifecycle: LifecycleState,
    pub has_audio_focus: bool,
}

pub struct PlaybackSession<P, F, N> {
    player: P,
    focus: F,
    indicator: N,
    current_station_id: Option<String>,
    current_station: Option<StationRecord>,
    lifecycle: LifecycleState,
    has_audio_focus: bool,
    /// The player holds a loaded (or loading) stream.
    player_loaded: bool,
    indicator_active: bool,
    active_token: Option<LoadToken>,
    next_token: u64,
}

impl<P: Player, F: AudioFocus, N: ActivityIndicator> PlaybackSession<P, F, N> {
    pub fn new(player: P, focus: F, indicator: N) -> Self {
        Self {
            player,
            focus,
            indicator,
            current_station_id: None,
            current_station: None,
            lifecycle: LifecycleState::Idle,
            has_audio_focus: false,
            player_loaded: false,
            indicator_active: false,
            active_token: None,
            next_token: 0,
        }
    }

    // ── transport ─────────────────────────────────────────────────────────────

    /// Select a station by id.  Re-selecting the playing station stops it.
    pub fn select_station<L>(&mut self, station_id: &str, stations: &L)
    where
        L: StationLookup + ?Sized,
    {
        if self.current_station_id.as_deref() == Some(station_id)
            && self.lifecycle == LifecycleState::Playing
        {
            info!("session: '{}' re-selected while playing, stopping", station_id);
            self.stop_playback();
            return;
        }

        let Some(station) = stations.lookup_station(station_id) else {
            debug!("session: select of unknown station '{}'", station_id);
            return;
        };
        self.start_station(station);
    }

    /// Start the last selected station again from scratch.  Unlike
    /// [`select_station`](Self::select_station) this never toggles off; a
    /// stream that is already starting or playing is reloaded.  No-op
    /// without a selection.
    pub fn resume<L>(&mut self, stations: &L)
    where
        L: StationLookup + ?Sized,
    {
        let Some(id) = self.current_station_id.clone() else {
            debug!("session: resume with nothing selected");
            return;
        };
        let Some(station) = stations.lookup_station(&id) else {
            debug!("session: last station '{}' no longer listed", id);
            return;
        };
        self.start_station(station);
    }

    pub fn pause(&mut self) {
        self.stop_playback();
    }

    pub fn stop(&mut self) {
        self.stop_playback();
    }

    // ── external events ───────────────────────────────────────────────────────

    pub fn on_player_event(&mut self, event: PlayerEvent) {
        if self.active_token != Some(event.token()) {
            debug!("session: ignoring stale player event {:?}", event);
            return;
        }

        match event {
            PlayerEvent::Prepared { .. } => {
                if self.lifecycle != LifecycleState::Buffering {
                    debug!("session: prepared while {:?}, ignoring", self.lifecycle);
                    return;
                }
                if let Err(e) = self.player.start() {
                    warn!("session: player failed to start: {}", e);
                    self.stop_playback();
                    return;
                }
                self.lifecycle = LifecycleState::Playing;
                let title = self
                    .current_station
                    .as_ref()
                    .map(|s| s.name.clone())
                    .unwrap_or_default();
                info!("session: playing '{}'", title);
                self.indicator.activate(&title);
                self.indicator_active = true;
            }
            PlayerEvent::Error { message, .. } => {
                let url = self.current_station.as_ref().map(|s| s.url.as_str());
                warn!("session: player error '{}' url={:?}", message, url);
                self.stop_playback();
            }
            PlayerEvent::Info { detail, .. } => {
                debug!("session: player info {}", detail);
            }
        }
    }

    pub fn on_focus_lost(&mut self, loss: FocusLoss) {
        if !self.is_active() {
            debug!("session: focus loss {:?} while {:?}", loss, self.lifecycle);
            self.has_audio_focus = false;
            return;
        }
        info!("session: audio focus lost ({:?}), stopping", loss);
        self.stop_playback();
    }

    /// Tear the player down and release focus.  The selection is kept.
    pub fn stop_playback(&mut self) {
        self.release_player();
        self.lifecycle = LifecycleState::Stopped;
        self.release_focus();
        self.indicator.deactivate();
        self.indicator_active = false;
    }

    /// Release everything before the hosting process exits.  The player is
    /// released at most once.
    pub fn shutdown(&mut self) {
        info!("session: shutting down");
        self.stop_playback();
    }

    // ── queries ───────────────────────────────────────────────────────────────

    pub fn lifecycle(&self) -> LifecycleState {
        self.lifecycle
    }

    pub fn current_station_id(&self) -> Option<&str> {
        self.current_station_id.as_deref()
    }

    pub fn has_audio_focus(&self) -> bool {
        self.has_audio_focus
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            current_station_id: self.current_station_id.clone(),
            current_station_name: self.current_station.as_ref().map(|s| s.name.clone()),
            lifecycle: self.lifecycle,
            has_audio_focus: self.has_audio_focus,
        }
    }

    pub fn player(&self) -> &P {
        &self.player
    }

    pub fn focus(&self) -> &F {
        &self.focus
    }

    pub fn focus_mut(&mut self) -> &mut F {
        &mut self.focus
    }

    pub fn indicator(&self) -> &N {
        &self.indicator
    }

    // ── internals ─────────────────────────────────────────────────────────────

    fn is_active(&self) -> bool {
        matches!(
            self.lifecycle,
            LifecycleState::Focusing | LifecycleState::Buffering | LifecycleState::Playing
        )
    }

    fn start_station(&mut self, station: StationRecord) {
        info!("session: selecting '{}' ({})", station.name, station.id);
        self.current_station_id = Some(station.id.clone());
        self.current_station = Some(station.clone());

        self.release_player();
        self.release_focus();
        if self.indicator_active {
            self.indicator.deactivate();
            self.indicator_active = false;
        }

        self.lifecycle = LifecycleState::Focusing;
        if !self.focus.request() {
            warn!("session: audio focus denied for '{}'", station.name);
            self.lifecycle = LifecycleState::Stopped;
            return;
        }
        self.has_audio_focus = true;

        self.next_token += 1;
        let token = LoadToken(self.next_token);
        info!("session: preparing name={} url={}", station.name, station.url);
        self.player_loaded = true;
        match self.player.load(token, &station.url) {
            Ok(()) => {
                self.active_token = Some(token);
                self.lifecycle = LifecycleState::Buffering;
            }
            Err(e) => {
                warn!("session: player rejected '{}': {}", station.url, e);
                self.stop_playback();
            }
        }
    }

    /// Best-effort stop + release; errors from a player in a bad state are
    /// swallowed.
    fn release_player(&mut self) {
        self.active_token = None;
        if !self.player_loaded {
            return;
        }
        if let Err(e) = self.player.stop() {
            debug!("session: player stop failed: {}", e);
        }
        self.player.release();
        self.player_loaded = false;
    }

    fn release_focus(&mut self) {
        if self.has_audio_focus {
            self.focus.abandon();
            self.has_audio_focus = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Load(LoadToken, String),
        Start,
        Stop,
        Release,
    }

    #[derive(Default)]
    struct FakePlayer {
        calls: Vec<Call>,
        fail_load: bool,
        fail_stop: bool,
    }

    impl Player for FakePlayer {
        fn load(&mut self, token: LoadToken, url: &str) -> Result<(), PlayerError> {
            self.calls.push(Call::Load(token, url.to_string()));
            if self.fail_load {
                return Err(PlayerError::Unavailable);
            }
            Ok(())
        }
        fn start(&mut self) -> Result<(), PlayerError> {
            self.calls.push(Call::Start);
            Ok(())
        }
        fn stop(&mut self) -> Result<(), PlayerError> {
            self.calls.push(Call::Stop);
            if self.fail_stop {
                return Err(PlayerError::Rejected("bad state".into()));
            }
            Ok(())
        }
        fn release(&mut self) {
            self.calls.push(Call::Release);
        }
    }

    impl FakePlayer {
        fn last_token(&self) -> LoadToken {
            self.calls
                .iter()
                .rev()
                .find_map(|c| match c {
                    Call::Load(t, _) => Some(*t),
                    _ => None,
                })
                .expect("no load issued")
        }
    }

    struct FakeFocus {
        grant: bool,
        requests: usize,
        abandons: usize,
    }

    impl Default for FakeFocus {
        fn default() -> Self {
            Self {
                grant: true,
                requests: 0,
                abandons: 0,
            }
        }
    }

    impl AudioFocus for FakeFocus {
        fn request(&mut self) -> bool {
            self.requests += 1;
            self.grant
        }
        fn abandon(&mut self) {
            self.abandons += 1;
        }
    }

    #[derive(Debug, PartialEq)]
    enum Signal {
        Active(String),
        Inactive,
    }

    #[derive(Default)]
    struct FakeIndicator {
        signals: Vec<Signal>,
    }

    impl FakeIndicator {
        fn is_active(&self) -> bool {
            matches!(self.signals.last(), Some(Signal::Active(_)))
        }
    }

    impl ActivityIndicator for FakeIndicator {
        fn activate(&mut self, title: &str) {
            self.signals.push(Signal::Active(title.to_string()));
        }
        fn deactivate(&mut self) {
            self.signals.push(Signal::Inactive);
        }
    }

    type TestSession = PlaybackSession<FakePlayer, FakeFocus, FakeIndicator>;

    fn stations() -> Vec<StationRecord> {
        vec![
            StationRecord::new("ambient", "Ambient", "https://h/radio/ambient.mp3"),
            StationRecord::new("jazz", "Jazz", "https://h/radio/jazz.mp3"),
        ]
    }

    fn session() -> TestSession {
        PlaybackSession::new(
            FakePlayer::default(),
            FakeFocus::default(),
            FakeIndicator::default(),
        )
    }

    fn play(session: &mut TestSession, id: &str) {
        session.select_station(id, stations().as_slice());
        let token = session.player().last_token();
        session.on_player_event(PlayerEvent::Prepared { token });
    }

    #[test]
    fn test_select_requests_focus_and_buffers() {
        let mut s = session();
        s.select_station("ambient", stations().as_slice());
        assert_eq!(s.lifecycle(), LifecycleState::Buffering);
        assert!(s.has_audio_focus());
        assert_eq!(s.focus().requests, 1);
        assert_eq!(
            s.player().calls,
            vec![Call::Load(LoadToken(1), "https://h/radio/ambient.mp3".into())]
        );
    }

    #[test]
    fn test_prepared_starts_and_activates_indicator() {
        let mut s = session();
        play(&mut s, "ambient");
        assert_eq!(s.lifecycle(), LifecycleState::Playing);
        assert_eq!(s.player().calls.last(), Some(&Call::Start));
        assert_eq!(s.indicator().signals, vec![Signal::Active("Ambient".into())]);
    }

    #[test]
    fn test_reselect_toggles_then_restarts() {
        let mut s = session();
        play(&mut s, "ambient");

        s.select_station("ambient", stations().as_slice());
        assert_eq!(s.lifecycle(), LifecycleState::Stopped);
        assert_eq!(s.current_station_id(), Some("ambient"));
        assert!(!s.indicator().is_active());

        s.select_station("ambient", stations().as_slice());
        assert_eq!(s.lifecycle(), LifecycleState::Buffering);
        let token = s.player().last_token();
        s.on_player_event(PlayerEvent::Prepared { token });
        assert_eq!(s.lifecycle(), LifecycleState::Playing);
    }

    #[test]
    fn test_reselect_while_buffering_restarts_load() {
        let mut s = session();
        s.select_station("ambient", stations().as_slice());
        s.select_station("ambient", stations().as_slice());
        assert_eq!(s.lifecycle(), LifecycleState::Buffering);
        assert_eq!(s.player().last_token(), LoadToken(2));
    }

    #[test]
    fn test_switching_station_tears_down_previous() {
        let mut s = session();
        play(&mut s, "ambient");
        s.select_station("jazz", stations().as_slice());

        assert_eq!(s.lifecycle(), LifecycleState::Buffering);
        assert_eq!(s.current_station_id(), Some("jazz"));
        assert_eq!(s.focus().abandons, 1);
        assert_eq!(s.focus().requests, 2);
        let calls = &s.player().calls;
        let n = calls.len();
        assert_eq!(
            calls[n - 3..],
            [
                Call::Stop,
                Call::Release,
                Call::Load(LoadToken(2), "https://h/radio/jazz.mp3".into())
            ]
        );
    }

    #[test]
    fn test_unknown_station_is_noop() {
        let mut s = session();
        s.select_station("nope", stations().as_slice());
        assert_eq!(s.lifecycle(), LifecycleState::Idle);
        assert_eq!(s.current_station_id(), None);
        assert_eq!(s.focus().requests, 0);
    }

    #[test]
    fn test_focus_denied_stays_stopped_without_player() {
        let mut s = session();
        s.focus_mut().grant = false;
        s.select_station("jazz", stations().as_slice());

        assert_eq!(s.lifecycle(), LifecycleState::Stopped);
        assert!(!s.has_audio_focus());
        assert_eq!(s.focus().requests, 1);
        assert!(s.player().calls.is_empty());
    }

    #[test]
    fn test_player_error_stops_from_any_state() {
        let mut s = session();
        play(&mut s, "jazz");
        let token = s.player().last_token();
        s.on_player_event(PlayerEvent::Error {
            token,
            message: "decoder".into(),
        });

        assert_eq!(s.lifecycle(), LifecycleState::Stopped);
        assert!(!s.has_audio_focus());
        assert_eq!(s.focus().abandons, 1);
        assert_eq!(s.indicator().signals.last(), Some(&Signal::Inactive));
        assert_eq!(s.current_station_id(), Some("jazz"));

        let mut s = session();
        s.select_station("jazz", stations().as_slice());
        let token = s.player().last_token();
        s.on_player_event(PlayerEvent::Error {
            token,
            message: "connect".into(),
        });
        assert_eq!(s.lifecycle(), LifecycleState::Stopped);
    }

    #[test]
    fn test_stale_events_are_ignored() {
        let mut s = session();
        s.select_station("ambient", stations().as_slice());
        let old = s.player().last_token();
        s.select_station("jazz", stations().as_slice());

        s.on_player_event(PlayerEvent::Error {
            token: old,
            message: "late".into(),
        });
        assert_eq!(s.lifecycle(), LifecycleState::Buffering);

        s.on_player_event(PlayerEvent::Prepared { token: old });
        assert_eq!(s.lifecycle(), LifecycleState::Buffering);
    }

    #[test]
    fn test_info_event_changes_nothing() {
        let mut s = session();
        s.select_station("ambient", stations().as_slice());
        let token = s.player().last_token();
        s.on_player_event(PlayerEvent::Info {
            token,
            detail: "position unknown".into(),
        });
        assert_eq!(s.lifecycle(), LifecycleState::Buffering);
    }

    #[test]
    fn test_focus_loss_while_playing_stops_and_keeps_selection() {
        for loss in [
            FocusLoss::Permanent,
            FocusLoss::Transient,
            FocusLoss::TransientCanDuck,
        ] {
            let mut s = session();
            play(&mut s, "ambient");
            s.on_focus_lost(loss);

            assert_eq!(s.lifecycle(), LifecycleState::Stopped);
            assert!(!s.indicator().is_active());
            assert_eq!(s.current_station_id(), Some("ambient"));
        }
    }

    #[test]
    fn test_focus_loss_while_buffering_stops() {
        let mut s = session();
        s.select_station("ambient", stations().as_slice());
        s.on_focus_lost(FocusLoss::Transient);
        assert_eq!(s.lifecycle(), LifecycleState::Stopped);
    }

    #[test]
    fn test_resume_without_selection_is_noop() {
        let mut s = session();
        s.resume(stations().as_slice());
        assert_eq!(s.lifecycle(), LifecycleState::Idle);
        assert_eq!(s.focus().requests, 0);
    }

    #[test]
    fn test_resume_after_stop_replays_last_station() {
        let mut s = session();
        play(&mut s, "jazz");
        s.pause();
        assert_eq!(s.lifecycle(), LifecycleState::Stopped);

        s.resume(stations().as_slice());
        assert_eq!(s.lifecycle(), LifecycleState::Buffering);
        assert_eq!(s.current_station_id(), Some("jazz"));
    }

    #[test]
    fn test_resume_while_playing_restarts_stream() {
        let mut s = session();
        play(&mut s, "jazz");
        s.resume(stations().as_slice());

        assert_eq!(s.lifecycle(), LifecycleState::Buffering);
        assert_eq!(s.current_station_id(), Some("jazz"));
        assert_eq!(s.player().last_token(), LoadToken(2));
        let calls = &s.player().calls;
        assert_eq!(
            calls[calls.len() - 3..],
            [
                Call::Stop,
                Call::Release,
                Call::Load(LoadToken(2), "https://h/radio/jazz.mp3".into())
            ]
        );

        let token = s.player().last_token();
        s.on_player_event(PlayerEvent::Prepared { token });
        assert_eq!(s.lifecycle(), LifecycleState::Playing);
    }

    #[test]
    fn test_resume_while_buffering_reloads() {
        let mut s = session();
        s.select_station("ambient", stations().as_slice());
        s.resume(stations().as_slice());
        assert_eq!(s.lifecycle(), LifecycleState::Buffering);
        assert_eq!(s.player().last_token(), LoadToken(2));
    }

    #[test]
    fn test_stop_swallows_player_errors() {
        let mut s = session();
        play(&mut s, "jazz");
        s.player.fail_stop = true;
        s.stop();
        assert_eq!(s.lifecycle(), LifecycleState::Stopped);
        assert_eq!(s.player().calls.last(), Some(&Call::Release));
    }

    #[test]
    fn test_load_failure_ends_stopped() {
        let mut s = session();
        s.player.fail_load = true;
        s.select_station("jazz", stations().as_slice());
        assert_eq!(s.lifecycle(), LifecycleState::Stopped);
        assert!(!s.has_audio_focus());
    }

    #[test]
    fn test_shutdown_releases_player_and_focus() {
        let mut s = session();
        play(&mut s, "ambient");
        s.shutdown();
        assert!(!s.has_audio_focus());
        assert_eq!(s.focus().abandons, 1);
        assert_eq!(s.player().calls.last(), Some(&Call::Release));
        let releases = s.player().calls.iter().filter(|c| **c == Call::Release).count();
        assert_eq!(releases, 1);
    }

    #[test]
    fn test_shutdown_after_stop_does_not_release_again() {
        let mut s = session();
        play(&mut s, "ambient");
        s.stop();
        let before = s.player().calls.len();
        s.shutdown();
        assert_eq!(s.player().calls.len(), before);

        let mut idle = session();
        idle.shutdown();
        assert!(idle.player().calls.is_empty());
    }

    #[test]
    fn test_snapshot() {
        let mut s = session();
        play(&mut s, "jazz");
        let snap = s.snapshot();
        assert_eq!(snap.current_station_id.as_deref(), Some("jazz"));
        assert_eq!(snap.current_station_name.as_deref(), Some("Jazz"));
        assert_eq!(snap.lifecycle, LifecycleState::Playing);
        assert!(snap.has_audio_focus);
    }
}
