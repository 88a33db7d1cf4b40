//! Per-connection actor: authenticates the upgraded socket, then runs the
//! handshake → message loop → cleanup lifecycle for one client.
//!
//! A dedicated writer task owns the socket's send half; every other task
//! only ever pushes frames into an unbounded channel. This keeps "send to
//! client" a cheap, non-blocking operation everywhere else in the gateway,
//! the same discipline the teacher's `ConnectedClient.sender` enforces.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use mycelium_auth::{has_capability, resolve_connect, ApiKeyStore, ConnectQuery};
use mycelium_bus::Bus;
use mycelium_protocol::{
    close_codes, decode_inbound, is_valid_channel_name, qualify_channel, BusPublish, DecodeError,
    InboundFrame, OutboundFrame, BUS_SUBJECT, MAX_CHANNELS, MAX_FRAME_BYTES, MAX_MESSAGES_PER_SECOND,
    PING_PERIOD, PONG_WAIT,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::hub::{Client, Hub};

/// Everything a connection actor needs, beyond the socket itself.
#[derive(Clone)]
pub struct ConnectionDeps {
    pub hub: Arc<Hub>,
    pub api_key_store: Arc<dyn ApiKeyStore>,
    pub bus: Arc<dyn Bus>,
    pub shutdown: watch::Receiver<bool>,
}

/// A unit of work for the writer task: either an outbound text frame or a
/// request to close the socket with a specific code.
enum WriterMsg {
    Text(String),
    Ping,
    Close(u16, String),
}

type WriterHandle = mpsc::UnboundedSender<WriterMsg>;

/// Run one connection through its full lifecycle. Returns once the socket
/// closes, auth fails, or the gateway starts shutting down.
pub async fn handle_connection(
    socket: WebSocket,
    query: ConnectQuery<'_>,
    remote_addr: SocketAddr,
    deps: ConnectionDeps,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<WriterMsg>();

    let writer_handle = tokio::spawn(async move {
        while let Some(msg) = writer_rx.recv().await {
            let sent = match msg {
                WriterMsg::Text(text) => ws_tx.send(Message::Text(text.into())).await,
                WriterMsg::Ping => ws_tx.send(Message::Ping(Vec::new().into())).await,
                WriterMsg::Close(code, reason) => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                },
            };
            if sent.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let outcome = match resolve_connect(query, deps.api_key_store.as_ref()).await {
        Ok(outcome) => outcome,
        Err(failure) => {
            warn!(remote_ip = %remote_addr.ip(), reason = %failure.reason, "connect auth failed");
            let _ = writer_tx.send(WriterMsg::Close(failure.code, failure.reason));
            drop(writer_tx);
            let _ = writer_handle.await;
            return;
        },
    };

    let session_id = outcome.session_id.clone();
    let app_id = outcome.app_id.clone();

    info!(session_id = %session_id, app_id = %app_id, "connection authenticated");

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<String>();
    let client = Client::new(
        session_id.clone(),
        app_id.clone(),
        outcome.api_key_id.clone(),
        outcome.capabilities,
        frame_tx,
    );
    if let Err(e) = deps.hub.register(client).await {
        warn!(session_id = %session_id, error = %e, "failed to track new connection");
        deps.hub.remove(&session_id).await;
        let _ = writer_tx.send(WriterMsg::Close(close_codes::INTERNAL_ERROR, "internal error".into()));
        drop(writer_tx);
        let _ = writer_handle.await;
        return;
    }

    let _ = writer_tx.send(WriterMsg::Text(
        OutboundFrame::Hello {
            sid: session_id.clone(),
        }
        .to_json(),
    ));

    // Forward frames the hub queues for this client (published events) into
    // the writer task alongside frames this loop produces directly.
    let forward_writer = writer_tx.clone();
    let forward_handle = tokio::spawn(async move {
        while let Some(text) = frame_rx.recv().await {
            if forward_writer.send(WriterMsg::Text(text)).is_err() {
                break;
            }
        }
    });

    run_message_loop(&mut ws_rx, &writer_tx, &session_id, &app_id, &deps).await;

    deps.hub.remove(&session_id).await;
    forward_handle.abort();
    drop(writer_tx);
    let _ = writer_handle.await;
    info!(session_id = %session_id, "connection closed");
}

async fn run_message_loop(
    ws_rx: &mut futures::stream::SplitStream<WebSocket>,
    writer_tx: &WriterHandle,
    session_id: &str,
    app_id: &str,
    deps: &ConnectionDeps,
) {
    let mut rate_ticker = tokio::time::interval(std::time::Duration::from_secs(1));
    let mut ping_ticker = tokio::time::interval(PING_PERIOD);
    let messages_this_tick = AtomicU32::new(0);
    let mut shutdown = deps.shutdown.clone();
    let mut last_pong = tokio::time::Instant::now();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = writer_tx.send(WriterMsg::Close(close_codes::SHUTTING_DOWN, "please reconnect".into()));
                    return;
                }
            }

            _ = ping_ticker.tick() => {
                let _ = writer_tx.send(WriterMsg::Ping);
            }

            _ = rate_ticker.tick() => {
                messages_this_tick.store(0, Ordering::Relaxed);

                if last_pong.elapsed() > PONG_WAIT {
                    debug!(session_id, "peer went silent past pong_wait, closing");
                    let _ = writer_tx.send(WriterMsg::Close(close_codes::PING_TIMEOUT, "ping timeout".into()));
                    return;
                }
            }

            msg = ws_rx.next() => {
                let Some(msg) = msg else { return };
                let text = match msg {
                    Ok(Message::Text(t)) => t.to_string(),
                    Ok(Message::Close(_)) => return,
                    Ok(Message::Pong(_)) => {
                        last_pong = tokio::time::Instant::now();
                        continue;
                    },
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(session_id, error = %e, "read error");
                        return;
                    },
                };

                if text.len() > MAX_FRAME_BYTES {
                    let _ = writer_tx.send(WriterMsg::Close(close_codes::INVALID_FRAME, "frame too large".into()));
                    return;
                }

                let count = messages_this_tick.fetch_add(1, Ordering::Relaxed) + 1;
                if count > MAX_MESSAGES_PER_SECOND {
                    let _ = writer_tx.send(WriterMsg::Close(close_codes::RATE_LIMITED, "rate limit exceeded".into()));
                    return;
                }

                if !handle_frame(&text, session_id, app_id, writer_tx, deps).await {
                    return;
                }
            }
        }
    }
}

/// Returns `false` if the connection should be closed.
async fn handle_frame(
    text: &str,
    session_id: &str,
    app_id: &str,
    writer_tx: &WriterHandle,
    deps: &ConnectionDeps,
) -> bool {
    match decode_inbound(text) {
        Err(DecodeError::InvalidFrame) => {
            let _ = writer_tx.send(WriterMsg::Close(close_codes::INVALID_FRAME, "invalid frame".into()));
            false
        },
        Err(DecodeError::InvalidData { s }) => {
            reply_error(writer_tx, s, "invalid data for message");
            true
        },
        Ok(InboundFrame::Unknown) => true,
        Ok(InboundFrame::Subscribe(d)) => {
            handle_subscribe(d, session_id, app_id, writer_tx, deps).await;
            true
        },
        Ok(InboundFrame::Unsubscribe(d)) => {
            handle_unsubscribe(d, session_id, app_id, writer_tx, deps).await;
            true
        },
        Ok(InboundFrame::Publish(d)) => {
            handle_publish(d, session_id, app_id, writer_tx, deps).await;
            true
        },
    }
}

async fn handle_subscribe(
    d: mycelium_protocol::SubscribeData,
    session_id: &str,
    app_id: &str,
    writer_tx: &WriterHandle,
    deps: &ConnectionDeps,
) {
    if !is_valid_channel_name(&d.c) {
        reply_error(writer_tx, Some(d.s), "invalid 'c' for message of type 'subscribe'");
        return;
    }

    let qualified = qualify_channel(app_id, &d.c);

    if deps.hub.is_subscribed(session_id, &qualified).await {
        reply_error(writer_tx, Some(d.s), format!("you're already subscribed to the channel {}", d.c));
        return;
    }

    if deps.hub.channel_count_of(session_id).await >= MAX_CHANNELS {
        reply_error(
            writer_tx,
            Some(d.s),
            format!("you can't subscribe to more than {MAX_CHANNELS} channels"),
        );
        return;
    }

    let Some(capabilities) = deps.hub.capabilities_of(session_id).await else {
        return;
    };
    if !has_capability("subscribe", &d.c, &capabilities) {
        reply_error(writer_tx, Some(d.s), format!("you're not allowed to subscribe to the channel {}", d.c));
        return;
    }

    deps.hub.subscribe(session_id, &qualified).await;
    let _ = writer_tx.send(WriterMsg::Text(OutboundFrame::SubscribeSuccess { s: d.s }.to_json()));
}

async fn handle_unsubscribe(
    d: mycelium_protocol::UnsubscribeData,
    session_id: &str,
    app_id: &str,
    writer_tx: &WriterHandle,
    deps: &ConnectionDeps,
) {
    if !is_valid_channel_name(&d.c) {
        reply_error(writer_tx, Some(d.s), "invalid 'c' for message of type 'unsubscribe'");
        return;
    }

    let qualified = qualify_channel(app_id, &d.c);
    if !deps.hub.unsubscribe(session_id, &qualified).await {
        reply_error(writer_tx, Some(d.s), format!("you're not subscribed to the channel {}", d.c));
        return;
    }

    let _ = writer_tx.send(WriterMsg::Text(OutboundFrame::UnsubscribeSuccess { s: d.s }.to_json()));
}

async fn handle_publish(
    d: mycelium_protocol::PublishData,
    session_id: &str,
    app_id: &str,
    writer_tx: &WriterHandle,
    deps: &ConnectionDeps,
) {
    if !is_valid_channel_name(&d.c) {
        reply_error(writer_tx, Some(d.s), "invalid 'c' for message of type 'publish'");
        return;
    }

    let qualified = qualify_channel(app_id, &d.c);
    if !deps.hub.is_subscribed(session_id, &qualified).await {
        reply_error(writer_tx, Some(d.s), format!("you're not subscribed to the channel {}", d.c));
        return;
    }

    let Some(capabilities) = deps.hub.capabilities_of(session_id).await else {
        return;
    };
    if !has_capability("publish", &d.c, &capabilities) {
        reply_error(writer_tx, Some(d.s), format!("you're not allowed to publish messages on the channel {}", d.c));
        return;
    }

    let pid = if d.ip { String::new() } else { session_id.to_string() };
    let payload = BusPublish {
        c: qualified,
        e: d.e,
        d: d.d,
        pid,
    };
    match serde_json::to_vec(&payload) {
        Ok(bytes) => {
            if let Err(e) = deps.bus.publish(BUS_SUBJECT, bytes.into()).await {
                warn!(session_id, error = %e, "failed to publish to bus");
                reply_error(writer_tx, Some(d.s), "internal error publishing message");
                return;
            }
            deps.hub.note_published_message(app_id).await;
            let _ = writer_tx.send(WriterMsg::Text(OutboundFrame::PublishSuccess { s: d.s }.to_json()));
        },
        Err(e) => {
            warn!(session_id, error = %e, "failed to encode bus payload");
            reply_error(writer_tx, Some(d.s), "internal error publishing message");
        },
    }
}

fn reply_error(writer_tx: &WriterHandle, s: Option<i64>, reason: impl Into<String>) {
    let _ = writer_tx.send(WriterMsg::Text(OutboundFrame::error(s, reason).to_json()));
}
