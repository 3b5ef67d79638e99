mod core;
mod focus;
mod http;
mod mpv;
mod socket;
mod state;

use radio_core::config::Config;
use radio_core::station::fallback_stations;
use radio_core::{FileKeyValueStore, StationCatalog, StationStore};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    /// The station list was replaced; carries the new catalog revision.
    CatalogChanged(u64),
    /// Foreground indicator on, with the station title.
    Active(String),
    Inactive,
    Log(String),
}

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Only WARN and ERROR go to integration clients
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No receivers is OK
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Broadcast channel first so logging can use it
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let data_dir = radio_core::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("headunit.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(broadcast_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,radio_headunit=debug,radio_core=debug")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let store = FileKeyValueStore::open(&config.store.path);
    let mut catalog = StationCatalog::new(
        StationStore::new(store),
        fallback_stations(&config.directory.stream_base),
    );
    catalog.bootstrap();

    // Event channel: all external inputs funnel into HeadunitCore
    let (event_tx, event_rx) = mpsc::channel::<core::ControlEvent>(256);

    let driver = mpv::MpvDriver::new(config.player.mpv_binary.clone(), config.player.volume);
    let (player, player_task) = mpv::spawn_player(driver, event_tx.clone());

    let headunit = core::HeadunitCore::new(
        &config,
        catalog,
        player,
        event_tx.clone(),
        broadcast_tx.clone(),
    )?;
    let view = headunit.state_view();

    if config.integration.enabled {
        let _socket_handle = socket::start_server(
            config.integration.bind_address.clone(),
            config.integration.port,
            view.clone(),
            event_tx.clone(),
            broadcast_tx.clone(),
        );
    }

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            view.clone(),
            event_tx.clone(),
        );
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            let _ = shutdown_tx.send(core::ControlEvent::Shutdown).await;
        }
    });
    drop(event_tx);

    info!("Head unit initialised, running event loop");
    headunit.run(event_rx).await?;

    // The player task kills mpv once the session's player is dropped.
    if tokio::time::timeout(std::time::Duration::from_secs(3), player_task)
        .await
        .is_err()
    {
        warn!("mpv player task did not exit in time");
    }

    Ok(())
}
