/// HeadunitCore: single-owner event loop for all mutable state.
///
/// The catalog and the playback session live here and nowhere else.  The
/// socket server, the HTTP API, the mpv player task and background directory
/// refreshes all send `ControlEvent` messages to this loop; readers see the
/// state the loop last published to the shared `StateView`.
///
/// After each event that changes observable state, the loop broadcasts
/// `BroadcastMessage::StateUpdated` to all listeners.
use radio_core::catalog::spawn_refresh;
use radio_core::config::Config;
use radio_core::protocol::{Command, HeadunitState};
use radio_core::{
    ActivityIndicator, CatalogEvent, Discovery, DirectoryClient, DirectoryParser, FocusLoss,
    KeyValueStore, PlaybackSession, Player, PlayerEvent, StationCatalog,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::focus::FocusArbiter;
use crate::state::StateView;
use crate::BroadcastMessage;

// ── ControlEvent ──────────────────────────────────────────────────────────────

/// All inputs into the control loop.
#[derive(Debug)]
pub enum ControlEvent {
    /// A command from an integration client or the HTTP API.
    Command(Command),
    /// Callback from the player backend.
    Player(PlayerEvent),
    /// Another audio source takes the output.
    FocusClaim(FocusLoss),
    FocusRelease,
    /// Result of a background directory refresh.
    Discovered(Discovery),
    Shutdown,
}

// ── indicator ─────────────────────────────────────────────────────────────────

/// Foreground signal for integration clients.
pub struct BroadcastIndicator {
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastIndicator {
    pub fn new(broadcast_tx: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { broadcast_tx }
    }
}

impl ActivityIndicator for BroadcastIndicator {
    fn activate(&mut self, title: &str) {
        let _ = self
            .broadcast_tx
            .send(BroadcastMessage::Active(title.to_string()));
    }

    fn deactivate(&mut self) {
        let _ = self.broadcast_tx.send(BroadcastMessage::Inactive);
    }
}

// ── HeadunitCore ──────────────────────────────────────────────────────────────

pub struct HeadunitCore<P, S> {
    catalog: StationCatalog<S>,
    session: PlaybackSession<P, FocusArbiter, BroadcastIndicator>,
    view: StateView,
    client: DirectoryClient,
    parser: DirectoryParser,
    status_url: String,
    refresh_on_start: bool,
    /// In-flight background refresh, aborted when a newer one starts.
    refresh_task: Option<AbortHandle>,
    control_tx: mpsc::Sender<ControlEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
}

impl<P: Player, S: KeyValueStore> HeadunitCore<P, S> {
    pub fn new(
        config: &Config,
        catalog: StationCatalog<S>,
        player: P,
        control_tx: mpsc::Sender<ControlEvent>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> anyhow::Result<Self> {
        let client = DirectoryClient::new(
            config.directory.connect_timeout(),
            config.directory.read_timeout(),
        )?;
        let session = PlaybackSession::new(
            player,
            FocusArbiter::new(),
            BroadcastIndicator::new(broadcast_tx.clone()),
        );

        Ok(Self {
            catalog,
            session,
            view: StateView::new(),
            client,
            parser: DirectoryParser::new(&config.directory.stream_base),
            status_url: config.directory.status_url.clone(),
            refresh_on_start: config.directory.refresh_on_start,
            refresh_task: None,
            control_tx,
            broadcast_tx,
        })
    }

    /// Shared read-only view (for the socket and HTTP servers).
    pub fn state_view(&self) -> StateView {
        self.view.clone()
    }

    /// Run the loop.  Returns when a `Shutdown` event is received or every
    /// sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<ControlEvent>) -> anyhow::Result<()> {
        info!("HeadunitCore: starting event loop");

        let mut catalog_rx = self.catalog.subscribe();
        let catalog_tx = self.broadcast_tx.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match catalog_rx.recv().await {
                    Ok(CatalogEvent::Changed { rev, .. }) => {
                        let _ = catalog_tx.send(BroadcastMessage::CatalogChanged(rev));
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.publish().await;
        if self.refresh_on_start {
            self.start_refresh();
        }

        loop {
            match event_rx.recv().await {
                None => {
                    info!("HeadunitCore: event channel closed, shutting down");
                    break;
                }
                Some(ControlEvent::Shutdown) => {
                    info!("HeadunitCore: shutdown requested");
                    break;
                }
                Some(event) => {
                    self.handle_event(event);
                    self.publish().await;
                }
            }
        }

        self.cleanup();
        forwarder.abort();
        Ok(())
    }

    pub fn handle_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Command(cmd) => {
                info!("HeadunitCore: command {:?}", cmd);
                self.handle_command(cmd);
            }
            ControlEvent::Player(evt) => self.session.on_player_event(evt),
            ControlEvent::FocusClaim(kind) => {
                if let Some(loss) = self.session.focus_mut().claim(kind) {
                    self.session.on_focus_lost(loss);
                }
            }
            ControlEvent::FocusRelease => self.session.focus_mut().release_claim(),
            ControlEvent::Discovered(discovery) => {
                if self.catalog.apply_discovery(discovery) {
                    self.refresh_task = None;
                }
            }
            ControlEvent::Shutdown => {}
        }
    }

    // ── command handlers ──────────────────────────────────────────────────────

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Select { id } => self.session.select_station(&id, &self.catalog),
            Command::Play => self.session.resume(&self.catalog),
            Command::Pause => self.session.pause(),
            Command::Stop => self.session.stop(),
            Command::Refresh => self.start_refresh(),
            // Served from the published view.
            Command::Browse { .. } | Command::GetState => {}
        }
    }

    /// Start a background refresh, superseding any in flight.
    fn start_refresh(&mut self) {
        if let Some(task) = self.refresh_task.take() {
            debug!("HeadunitCore: aborting superseded refresh");
            task.abort();
        }
        let generation = self.catalog.begin_refresh();
        info!(
            "HeadunitCore: refreshing directory from {} (#{})",
            self.status_url, generation
        );
        let handle = spawn_refresh(
            self.client.clone(),
            self.parser.clone(),
            self.status_url.clone(),
            generation,
            self.control_tx.clone(),
            ControlEvent::Discovered,
        );
        self.refresh_task = Some(handle.abort_handle());
    }

    // ── helpers ───────────────────────────────────────────────────────────────

    fn current_state(&self) -> HeadunitState {
        HeadunitState {
            session: self.session.snapshot(),
            catalog_origin: self.catalog.origin(),
            station_count: self.catalog.current_list().len(),
            catalog_rev: self.catalog.rev(),
            refreshed_at: self.catalog.refreshed_at(),
        }
    }

    async fn publish(&self) {
        let state = self.current_state();
        if self.view.publish(state, self.catalog.current_list()).await {
            let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
        }
    }

    fn cleanup(&mut self) {
        info!("HeadunitCore: cleanup");
        if let Some(task) = self.refresh_task.take() {
            task.abort();
        }
        self.session.shutdown();
    }
}
