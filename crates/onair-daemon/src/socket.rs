use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use onair_proto::protocol::{Broadcast, Command, Message, PROTOCOL_VERSION};

use crate::events::{BroadcastMessage, EventReceiver};
use crate::moderation::DecideOutcome;
use crate::DaemonContext;

/// Per-connection state.  `user_id` is set by `register-user` and gates
/// delivery of personal notifications.
struct ClientSession {
    id: usize,
    user_id: Option<String>,
}

pub fn start_server(bind_address: String, port: u16, context: DaemonContext) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);

        let mut client_id = 0usize;

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;
                    info!("Client {} connected from {}", id, peer);

                    let ctx = context.clone();
                    let broadcast_rx = context.events.subscribe();

                    tokio::spawn(async move {
                        handle_client(stream, ctx, id, broadcast_rx).await;
                        info!("Client {} disconnected", id);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    })
}

async fn handle_client(
    stream: TcpStream,
    context: DaemonContext,
    client_id: usize,
    mut broadcast_rx: EventReceiver,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();
    let mut session = ClientSession {
        id: client_id,
        user_id: None,
    };

    // Full state bootstrap on connect, so the client never has to poll.
    if send_hello(&context, &mut write_half).await.is_err() {
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
                            if read_buf.len() < 4 { break; }
                            match Message::decode(&read_buf) {
                                Ok((Message::Command(cmd), consumed)) => {
                                    read_buf.drain(..consumed);

                                    if dispatch(cmd, &mut session, &context, &mut write_half).await.is_err() {
                                        return;
                                    }
                                }
                                Ok((_, consumed)) => {
                                    read_buf.drain(..consumed);
                                }
                                Err(e) => {
                                    // A complete frame that fails to parse is
                                    // dropped; a partial one waits for more data.
                                    match Message::frame_len(&read_buf) {
                                        Some(len) if read_buf.len() >= len => {
                                            warn!("Client {} sent malformed frame: {}", client_id, e);
                                            read_buf.drain(..len);
                                        }
                                        _ => break,
                                    }
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
                match msg {
                    Ok(msg) => {
                        let Some(wire) = to_wire(msg, &session) else { continue };
                        if send(&mut write_half, wire).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages, resyncing", client_id, n);
                        if send_hello(&context, &mut write_half).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

async fn dispatch(
    cmd: Command,
    session: &mut ClientSession,
    context: &DaemonContext,
    write: &mut OwnedWriteHalf,
) -> anyhow::Result<()> {
    match cmd {
        Command::GetQueue { genre, platform } => {
            let (entries, current) = context.scheduler.query_sync(genre, platform).await;
            send(write, Broadcast::QueueUpdate { genre, platform, entries }).await?;
            send(write, Broadcast::NowPlaying { genre, platform, current }).await?;
        }
        Command::GetModerationQueue => {
            let requests = context.moderation.pending().await;
            send(write, Broadcast::ModerationQueue { requests }).await?;
        }
        Command::ChangePlatform { genre, platform } => {
            context.scheduler.switch_platform(genre, platform).await;
        }
        Command::SyncPlatform { genre } => {
            let platform = context.scheduler.selection(genre).await;
            let (_, current) = context.scheduler.query_sync(genre, platform).await;
            send(write, Broadcast::PlatformSync { genre, platform, current }).await?;
        }
        Command::NewRequest { genre, platform, request } => {
            if let Err(e) = context.moderation.submit(genre, platform, request).await {
                warn!("Client {} request submission failed: {:#}", session.id, e);
                send(write, Broadcast::Error { message: format!("{:#}", e) }).await?;
            }
        }
        Command::ModerateRequest { id, action, reason } => {
            match context.moderation.decide(&id, action, reason).await {
                Ok(DecideOutcome::NotFound) => {
                    send(write, Broadcast::Error {
                        message: format!("request {} not found", id),
                    })
                    .await?;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Client {} moderation failed for {}: {:#}", session.id, id, e);
                    send(write, Broadcast::Error { message: format!("{:#}", e) }).await?;
                }
            }
        }
        Command::RegisterUser { user_id } => {
            session.user_id = Some(user_id);
        }
    }
    Ok(())
}

/// Map an internal fan-out message to its wire broadcast.  Personal
/// notifications only reach the connection registered for their user.
fn to_wire(msg: BroadcastMessage, session: &ClientSession) -> Option<Broadcast> {
    match msg {
        BroadcastMessage::Queue { genre, platform, entries } => {
            Some(Broadcast::QueueUpdate { genre, platform, entries })
        }
        BroadcastMessage::NowPlaying { genre, platform, current } => {
            Some(Broadcast::NowPlaying { genre, platform, current })
        }
        BroadcastMessage::ModerationQueue { requests } => {
            Some(Broadcast::ModerationQueue { requests })
        }
        BroadcastMessage::Cooldown { genre, user_id, until } => {
            Some(Broadcast::CooldownUpdate { genre, user_id, until })
        }
        BroadcastMessage::Notification { notification } => {
            if session.user_id.as_deref() == Some(notification.user_id.as_str()) {
                Some(Broadcast::NewNotification { notification })
            } else {
                None
            }
        }
    }
}

async fn send(write: &mut OwnedWriteHalf, broadcast: Broadcast) -> anyhow::Result<()> {
    let encoded = Message::Broadcast(broadcast).encode()?;
    write.write_all(&encoded).await?;
    Ok(())
}

async fn send_hello(context: &DaemonContext, write: &mut OwnedWriteHalf) -> anyhow::Result<()> {
    let state = context.scheduler.full_state().await;
    send(
        write,
        Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            daemon_rev: context.scheduler.rev(),
            state,
        },
    )
    .await
}
