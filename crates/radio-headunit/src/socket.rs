use crate::core::ControlEvent;
use crate::state::StateView;
use crate::BroadcastMessage;
use radio_core::protocol::{Broadcast, Command, Message, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

/// Largest frame a client may announce.  Anything bigger drops the client.
const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Framed integration socket for the car display.
pub fn start_server(
    bind_address: String,
    port: u16,
    view: StateView,
    event_tx: mpsc::Sender<ControlEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("Integration socket listening at {}", addr);
        serve(listener, view, event_tx, broadcast_tx).await;
    })
}

async fn serve(
    listener: TcpListener,
    view: StateView,
    event_tx: mpsc::Sender<ControlEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) {
    let mut client_id = 0usize;
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                client_id += 1;
                let id = client_id;
                info!("Client {} connected from {}", id, peer);

                let view = view.clone();
                let evt_tx = event_tx.clone();
                let bcast_rx = broadcast_tx.subscribe();
                tokio::spawn(async move {
                    handle_client(stream, view, id, evt_tx, bcast_rx).await;
                    info!("Client {} disconnected", id);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    view: StateView,
    client_id: usize,
    event_tx: mpsc::Sender<ControlEvent>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    let hello = Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        state: view.get_state().await,
    };
    if send(&mut write_half, hello).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            let Some(len) = announced_len(&read_buf) else { break; };
                            if len > MAX_FRAME_LEN {
                                warn!("Client {} announced a {} byte frame, dropping", client_id, len);
                                return;
                            }
                            match Message::decode(&read_buf) {
                                Ok((Message::Command(cmd), consumed)) => {
                                    read_buf.drain(..consumed);
                                    info!("Client {} sent command: {:?}", client_id, cmd);
                                    if let Err(e) = answer(&mut write_half, &view, &event_tx, cmd).await {
                                        warn!("Client {}: {}", client_id, e);
                                        return;
                                    }
                                }
                                Ok((_, consumed)) => {
                                    read_buf.drain(..consumed);
                                }
                                Err(_) if incomplete(&read_buf) => break,
                                Err(e) => {
                                    warn!("Client {} sent an undecodable frame: {}", client_id, e);
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                let broadcast = match msg {
                    Ok(BroadcastMessage::StateUpdated) => Broadcast::State { data: view.get_state().await },
                    Ok(BroadcastMessage::CatalogChanged(rev)) => Broadcast::CatalogChanged { rev },
                    Ok(BroadcastMessage::Active(title)) => Broadcast::Active { title },
                    Ok(BroadcastMessage::Inactive) => Broadcast::Inactive,
                    Ok(BroadcastMessage::Log(message)) => Broadcast::Log { message },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        Broadcast::State { data: view.get_state().await }
                    }
                    Err(_) => break,
                };
                if send(&mut write_half, broadcast).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// A decode failure only means "wait for more" while the announced frame
/// has not fully arrived.
fn incomplete(buf: &[u8]) -> bool {
    match announced_len(buf) {
        Some(len) => buf.len() < 4 + len,
        None => true,
    }
}

fn announced_len(buf: &[u8]) -> Option<usize> {
    let header: [u8; 4] = buf.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(header) as usize)
}

/// Browse and GetState are answered directly; everything else goes to the
/// control loop, whose state change reaches the client as a broadcast.
async fn answer<W>(
    writer: &mut W,
    view: &StateView,
    event_tx: &mpsc::Sender<ControlEvent>,
    cmd: Command,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match cmd {
        Command::Browse { parent } => {
            let items = view.children(&parent).await;
            send(writer, Broadcast::Children { parent, items }).await
        }
        Command::GetState => {
            send(writer, Broadcast::State { data: view.get_state().await }).await
        }
        cmd => event_tx
            .send(ControlEvent::Command(cmd))
            .await
            .map_err(|_| anyhow::anyhow!("control loop gone")),
    }
}

async fn send<W>(writer: &mut W, broadcast: Broadcast) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = Message::Broadcast(broadcast).encode()?;
    writer.write_all(&encoded).await?;
    Ok(())
}
