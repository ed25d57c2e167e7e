//! Session router: owns one [`DocumentHandle`] per open slug and drives the
//! per-connection WebSocket loop, including outbound backpressure and the
//! application-level heartbeat.
//!
//! A broadcast fan-out loop races against an inbound read loop, generalized
//! here into a `select!` over the inbound socket, the outbound queue, and a
//! heartbeat timer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use inkwell_protocol::{AuthOutcome, ClientFrame, ServerFrame, Slug, SnapshotFrame};
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::document::{self, ApplyOutcome, Broadcast, DocumentHandle, EditCommand};

/// Capacity of each session's outbound queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;
/// Close code sent to a session whose outbound queue overflowed.
pub const CLOSE_SLOW_CONSUMER: u16 = 1013;
/// Close code sent when a client frame fails to parse.
pub const CLOSE_MALFORMED_FRAME: u16 = 1007;
/// How long a session may go without a client-initiated ping before it's
/// considered dead.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Hub {
    documents: DashMap<Slug, DocumentHandle>,
    vault_root: PathBuf,
    transform_window: u64,
    snapshot_threshold: u64,
}

impl Hub {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            documents: DashMap::new(),
            vault_root: config.storage.clone(),
            transform_window: config.transform_window,
            snapshot_threshold: config.snapshot_threshold,
        }
    }

    /// Look up or lazily open the document for `slug`.
    pub async fn get_or_spawn(&self, slug: &Slug) -> anyhow::Result<DocumentHandle> {
        if let Some(handle) = self.documents.get(slug) {
            return Ok(handle.clone());
        }
        let handle = document::spawn(self.vault_root.clone(), slug.clone(), self.transform_window, self.snapshot_threshold).await?;
        self.documents.insert(slug.clone(), handle.clone());
        Ok(handle)
    }

    /// Evict idle presence entries from every open document, then drop the
    /// handles of documents left with no subscribers. Runs on a fixed
    /// interval from `main.rs`.
    pub async fn sweep(&self, idle: Duration) {
        let idle_ms = idle.as_millis() as u64;
        let slugs: Vec<Slug> = self.documents.iter().map(|entry| entry.key().clone()).collect();
        for slug in slugs {
            let Some(handle) = self.documents.get(&slug).map(|entry| entry.value().clone()) else {
                continue;
            };
            handle.evict_idle(idle_ms).await;
            if handle.is_idle().await {
                self.documents.remove(&slug);
                info!(%slug, "closed idle document");
            }
        }
    }

    pub fn open_document_count(&self) -> usize {
        self.documents.len()
    }
}

enum CloseReason {
    ClientClosed,
    SlowConsumer,
    HeartbeatTimeout,
    MalformedFrame,
}

/// Drive one WebSocket connection for `slug` until it closes. `password` is
/// whatever credential the upgrade handler already extracted from the
/// request (HTTP Basic auth); the document itself re-validates it, so a
/// compromised upgrade handler can't forge access.
pub async fn handle_socket(socket: WebSocket, hub: Arc<Hub>, slug: Slug, password: Option<String>, heartbeat: Duration) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let handle = match hub.get_or_spawn(&slug).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!(%slug, error = %e, "failed to open document for websocket session");
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };

    let subscribed = match handle.subscribe(password).await {
        Ok(Ok(result)) => result,
        Ok(Err(rejection)) => {
            warn!(%slug, ?rejection, "websocket subscribe rejected");
            let _ = ws_tx.send(close_frame(1008, "unauthorised")).await;
            return;
        }
        Err(e) => {
            warn!(%slug, error = %e, "document actor unreachable during subscribe");
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };
    let client_id = subscribed.client_id;

    let snapshot = ServerFrame::Snapshot(SnapshotFrame {
        rev: subscribed.rev,
        text: subscribed.text,
        presence: subscribed.presence,
        auth: AuthOutcome::Ok,
    });
    if send_frame(&mut ws_tx, &snapshot).await.is_err() {
        handle.leave(client_id).await;
        return;
    }

    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_QUEUE_CAPACITY);
    let (close_tx, mut close_rx) = mpsc::channel::<()>(1);

    let mut broadcast_rx = handle.subscribe_broadcast();
    let fan_out_tx = out_tx.clone();
    let fan_out_close = close_tx.clone();
    let fan_out = tokio::spawn(async move {
        loop {
            let msg = match broadcast_rx.recv().await {
                Ok(msg) => msg,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let frame = match msg {
                Broadcast::Applied { rev, op_id, author_id, ops } => ServerFrame::Applied { rev, op_id, author_id, ops },
                Broadcast::PresenceDiff(diff) => ServerFrame::PresenceDiffFrame(diff),
            };
            if fan_out_tx.try_send(frame).is_err() {
                let _ = fan_out_close.try_send(());
                break;
            }
        }
    });

    let mut last_ping = Instant::now();
    let mut heartbeat_timer = interval(heartbeat);
    heartbeat_timer.tick().await;

    let close_reason = loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => {
                                if !handle_client_frame(frame, &handle, client_id, &out_tx, &mut last_ping).await {
                                    break CloseReason::SlowConsumer;
                                }
                            }
                            Err(e) => {
                                warn!(%slug, client_id, error = %e, "malformed client frame");
                                break CloseReason::MalformedFrame;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break CloseReason::ClientClosed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(%slug, client_id, error = %e, "websocket read error");
                        break CloseReason::ClientClosed;
                    }
                }
            }
            outgoing = out_rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        if send_frame(&mut ws_tx, &frame).await.is_err() {
                            break CloseReason::ClientClosed;
                        }
                    }
                    None => break CloseReason::ClientClosed,
                }
            }
            _ = close_rx.recv() => break CloseReason::SlowConsumer,
            _ = heartbeat_timer.tick() => {
                if last_ping.elapsed() > PONG_TIMEOUT {
                    warn!(%slug, client_id, "no heartbeat within timeout, closing session");
                    break CloseReason::HeartbeatTimeout;
                }
            }
        }
    };

    fan_out.abort();
    handle.leave(client_id).await;

    let close = match close_reason {
        CloseReason::SlowConsumer => close_frame(CLOSE_SLOW_CONSUMER, "outbound queue overflow"),
        CloseReason::HeartbeatTimeout => close_frame(1001, "heartbeat timeout"),
        CloseReason::MalformedFrame => close_frame(CLOSE_MALFORMED_FRAME, "malformed frame"),
        CloseReason::ClientClosed => Message::Close(None),
    };
    let _ = ws_tx.send(close).await;
}

async fn handle_client_frame(
    frame: ClientFrame,
    handle: &DocumentHandle,
    client_id: u64,
    out_tx: &mpsc::Sender<ServerFrame>,
    last_ping: &mut Instant,
) -> bool {
    match frame {
        ClientFrame::Join { .. } => true,
        ClientFrame::Edit(req) => {
            let op_id = req.op_id;
            let author_id = req.author_id;
            let cmd = EditCommand { base_rev: req.base_rev, ops: req.ops, author_id: req.author_id, op_id: req.op_id };
            match handle.apply_edit(client_id, cmd).await {
                // A fresh apply is delivered to this session through the
                // document's broadcast fan-out, same as every other
                // subscriber, so there's nothing more to do here.
                Ok(ApplyOutcome::Accepted { .. }) => true,
                // A resent `op_id` that hit the dedup cache never broadcasts
                // (it changed nothing for other subscribers), so the
                // resubmitting session needs its ack sent directly instead.
                Ok(ApplyOutcome::Replayed { rev, transformed_ops }) => {
                    out_tx.try_send(ServerFrame::Applied { rev, op_id, author_id, ops: transformed_ops }).is_ok()
                }
                Ok(ApplyOutcome::Rejected(rejection)) => {
                    out_tx.try_send(ServerFrame::Rejected { op_id, reason: rejection.into() }).is_ok()
                }
                Err(e) => {
                    warn!(error = %e, "document actor unreachable handling edit");
                    false
                }
            }
        }
        ClientFrame::Cursor(cursor) => {
            handle.update_cursor(client_id, cursor).await;
            true
        }
        ClientFrame::Ime(ime) => {
            handle.update_ime(client_id, ime).await;
            true
        }
        ClientFrame::Profile(update) => {
            handle.update_profile(client_id, update.label, update.color).await;
            true
        }
        ClientFrame::Ping => {
            *last_ping = Instant::now();
            out_tx.try_send(ServerFrame::Pong).is_ok()
        }
        ClientFrame::Unknown => true,
    }
}

async fn send_frame(ws_tx: &mut (impl SinkExt<Message> + Unpin), frame: &ServerFrame) -> Result<(), ()> {
    let text = serde_json::to_string(frame).expect("ServerFrame always serializes");
    ws_tx.send(Message::Text(text)).await.map_err(|_| ())
}

fn close_frame(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame { code, reason: reason.into() }))
}
