//! The per-slug document state machine: an actor owning an exclusive
//! serialisation context over `text`, `rev`, `op_log`, `password_hash`, and
//! `presence`.
//!
//! Mutations arrive as [`Command`] messages over a bounded mailbox; the
//! actor task processes them one at a time, which is what gives every
//! session a total order over edits for this slug "for free" instead of
//! needing to reason about lock ordering.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use inkwell_protocol::{AppliedOp, CursorState, ImeEvent, Operation, PresenceEntry, Slug};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::verify_password;
use crate::buffer::TextBuffer;
use crate::durability::{DocumentMeta, Durability};
use crate::error::ApplyRejection;
use crate::presence::{self, PresenceRegistry};

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

pub struct SubscribeResult {
    pub client_id: u64,
    pub rev: u64,
    pub text: String,
    pub presence: Vec<PresenceEntry>,
    pub needs_password: bool,
}

/// A read-only view of document state, used by the plain HTTP snapshot
/// endpoint which doesn't hold a live presence slot.
pub struct PeekResult {
    pub rev: u64,
    pub text: String,
    pub presence: Vec<PresenceEntry>,
}

pub enum ApplyOutcome {
    /// A fresh apply: already broadcast to every subscriber (including the
    /// caller), so the hub doesn't need to send anything else.
    Accepted { rev: u64, transformed_ops: Vec<Operation> },
    /// Re-submission of an `op_id` already in the dedup window. Nothing
    /// changed for other subscribers, so this was never broadcast; the hub
    /// must send this ack directly to the resubmitting session.
    Replayed { rev: u64, transformed_ops: Vec<Operation> },
    Rejected(ApplyRejection),
}

/// A minimal edit request, already authenticated by the caller. Mirrors
/// `inkwell_protocol::EditRequest` but is decoupled from the wire type so
/// the actor doesn't need to know about cursor fields it doesn't use.
pub struct EditCommand {
    pub base_rev: u64,
    pub ops: Vec<Operation>,
    pub author_id: Uuid,
    pub op_id: Uuid,
}

enum Command {
    Subscribe {
        password: Option<String>,
        reply: oneshot::Sender<Result<SubscribeResult, ApplyRejection>>,
    },
    Peek {
        password: Option<String>,
        reply: oneshot::Sender<Result<PeekResult, ApplyRejection>>,
    },
    Leave {
        client_id: u64,
    },
    ApplyEdit {
        client_id: u64,
        req: EditCommand,
        reply: oneshot::Sender<ApplyOutcome>,
    },
    UpdateCursor {
        client_id: u64,
        cursor: CursorState,
    },
    UpdateIme {
        client_id: u64,
        ime: ImeEvent,
    },
    UpdateProfile {
        client_id: u64,
        label: Option<String>,
        color: Option<String>,
    },
    Touch {
        client_id: u64,
    },
    SetPassword {
        current: Option<String>,
        new: Option<String>,
        reply: oneshot::Sender<Result<(), ApplyRejection>>,
    },
    EvictIdle {
        idle_ms: u64,
    },
    IsIdle {
        reply: oneshot::Sender<bool>,
    },
    ProbeRecovery,
}

/// Broadcast to every subscriber of a document. Sessions translate these
/// into wire [`inkwell_protocol::ServerFrame`]s; kept separate so the actor
/// doesn't depend on the hub's session bookkeeping.
#[derive(Clone, Debug)]
pub enum Broadcast {
    Applied { rev: u64, op_id: Uuid, author_id: Uuid, ops: Vec<Operation> },
    PresenceDiff(inkwell_protocol::PresenceDiff),
}

struct Dedup {
    window: VecDeque<(Uuid, Uuid)>,
    results: HashMap<(Uuid, Uuid), (u64, Vec<Operation>)>,
    capacity: usize,
}

impl Dedup {
    fn new(capacity: usize) -> Self {
        Self { window: VecDeque::new(), results: HashMap::new(), capacity: capacity.max(1) }
    }

    fn get(&self, author_id: Uuid, op_id: Uuid) -> Option<(u64, Vec<Operation>)> {
        self.results.get(&(author_id, op_id)).cloned()
    }

    fn insert(&mut self, author_id: Uuid, op_id: Uuid, rev: u64, ops: Vec<Operation>) {
        let key = (author_id, op_id);
        self.results.insert(key, (rev, ops));
        self.window.push_back(key);
        while self.window.len() > self.capacity {
            if let Some(old) = self.window.pop_front() {
                self.results.remove(&old);
            }
        }
    }
}

struct State {
    buffer: TextBuffer,
    rev: u64,
    op_log: VecDeque<AppliedOp>,
    password_hash: Option<String>,
    created_ms: u64,
    presence: PresenceRegistry,
    dedup: Dedup,
    degraded: bool,
    next_client_id: AtomicU64,
    subscriber_count: usize,
}

pub struct DocumentActor {
    state: State,
    durability: Durability,
    transform_window: u64,
    snapshot_threshold: u64,
    snapshot_rev_gap: u64,
    broadcast_tx: broadcast::Sender<Broadcast>,
    cmd_rx: mpsc::Receiver<Command>,
}

/// The cloneable front-end to a running [`DocumentActor`].
#[derive(Clone)]
pub struct DocumentHandle {
    cmd_tx: mpsc::Sender<Command>,
    broadcast_tx: broadcast::Sender<Broadcast>,
}

impl DocumentHandle {
    pub fn subscribe_broadcast(&self) -> broadcast::Receiver<Broadcast> {
        self.broadcast_tx.subscribe()
    }

    pub async fn subscribe(&self, password: Option<String>) -> anyhow::Result<Result<SubscribeResult, ApplyRejection>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Subscribe { password, reply: tx }).await?;
        Ok(rx.await?)
    }

    pub async fn peek(&self, password: Option<String>) -> anyhow::Result<Result<PeekResult, ApplyRejection>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Peek { password, reply: tx }).await?;
        Ok(rx.await?)
    }

    pub async fn leave(&self, client_id: u64) {
        let _ = self.cmd_tx.send(Command::Leave { client_id }).await;
    }

    pub async fn apply_edit(&self, client_id: u64, req: EditCommand) -> anyhow::Result<ApplyOutcome> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::ApplyEdit { client_id, req, reply: tx }).await?;
        Ok(rx.await?)
    }

    pub async fn update_cursor(&self, client_id: u64, cursor: CursorState) {
        let _ = self.cmd_tx.send(Command::UpdateCursor { client_id, cursor }).await;
    }

    pub async fn update_ime(&self, client_id: u64, ime: ImeEvent) {
        let _ = self.cmd_tx.send(Command::UpdateIme { client_id, ime }).await;
    }

    pub async fn update_profile(&self, client_id: u64, label: Option<String>, color: Option<String>) {
        let _ = self.cmd_tx.send(Command::UpdateProfile { client_id, label, color }).await;
    }

    pub async fn touch(&self, client_id: u64) {
        let _ = self.cmd_tx.send(Command::Touch { client_id }).await;
    }

    pub async fn set_password(&self, current: Option<String>, new: Option<String>) -> anyhow::Result<Result<(), ApplyRejection>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::SetPassword { current, new, reply: tx }).await?;
        Ok(rx.await?)
    }

    pub async fn evict_idle(&self, idle_ms: u64) {
        let _ = self.cmd_tx.send(Command::EvictIdle { idle_ms }).await;
    }

    pub async fn is_idle(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::IsIdle { reply: tx }).await.is_err() {
            return true;
        }
        rx.await.unwrap_or(true)
    }
}

/// Spawn a document actor for `slug`, recovering its state from the vault.
/// The `Loading -> Ready` transition happens inside this call; by the time
/// it returns the actor is `Ready`.
pub async fn spawn(vault_root: PathBuf, slug: Slug, transform_window: u64, snapshot_threshold: u64) -> anyhow::Result<DocumentHandle> {
    let (durability, recovered) = Durability::open(&vault_root, &slug, transform_window).await?;

    let mut op_log = VecDeque::with_capacity(recovered.op_log.len());
    let mut dedup = Dedup::new(transform_window as usize);
    for applied in recovered.op_log {
        dedup.insert(applied.author_id, applied.op_id, applied.rev, vec![applied.op.clone()]);
        op_log.push_back(applied);
    }

    let state = State {
        buffer: TextBuffer::new(&recovered.text),
        rev: recovered.rev,
        op_log,
        password_hash: recovered.meta.password_hash,
        created_ms: recovered.meta.created_ms,
        presence: PresenceRegistry::default(),
        dedup,
        degraded: false,
        next_client_id: AtomicU64::new(0),
        subscriber_count: 0,
    };

    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (broadcast_tx, _) = broadcast::channel(1024);

    let actor = DocumentActor {
        state,
        durability,
        transform_window,
        snapshot_threshold,
        snapshot_rev_gap: crate::config::DEFAULT_SNAPSHOT_REV_GAP,
        broadcast_tx: broadcast_tx.clone(),
        cmd_rx,
    };

    tokio::spawn(run(actor, slug));

    let probe_tx = cmd_tx.clone();
    tokio::spawn(async move {
        let mut backoff = RETRY_BACKOFF_INITIAL;
        loop {
            tokio::time::sleep(backoff).await;
            if probe_tx.send(Command::ProbeRecovery).await.is_err() {
                break;
            }
            backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
        }
    });

    Ok(DocumentHandle { cmd_tx, broadcast_tx })
}

async fn run(mut actor: DocumentActor, slug: Slug) {
    while let Some(cmd) = actor.cmd_rx.recv().await {
        actor.handle(cmd, &slug);
    }
    info!(%slug, "document actor shutting down");
}

impl DocumentActor {
    fn handle(&mut self, cmd: Command, slug: &Slug) {
        match cmd {
            Command::Subscribe { password, reply } => {
                let result = self.handle_subscribe(password);
                let _ = reply.send(result);
            }
            Command::Peek { password, reply } => {
                let result = self.handle_peek(password);
                let _ = reply.send(result);
            }
            Command::Leave { client_id } => {
                self.state.subscriber_count = self.state.subscriber_count.saturating_sub(1);
                if self.state.presence.leave(client_id) {
                    if let Some(diff) = presence::diff(vec![], vec![], vec![client_id]) {
                        let _ = self.broadcast_tx.send(Broadcast::PresenceDiff(diff));
                    }
                }
            }
            Command::ApplyEdit { client_id, req, reply } => {
                let outcome = self.handle_apply_edit(req, slug);
                if !matches!(outcome, ApplyOutcome::Rejected(_)) {
                    self.state.presence.touch(client_id);
                }
                let _ = reply.send(outcome);
            }
            Command::UpdateCursor { client_id, cursor } => {
                if let Some(entry) = self.state.presence.update_cursor(client_id, cursor) {
                    if let Some(diff) = presence::diff(vec![], vec![entry], vec![]) {
                        let _ = self.broadcast_tx.send(Broadcast::PresenceDiff(diff));
                    }
                }
            }
            Command::UpdateIme { client_id, ime } => {
                if let Some(entry) = self.state.presence.update_ime(client_id, ime) {
                    if let Some(diff) = presence::diff(vec![], vec![entry], vec![]) {
                        let _ = self.broadcast_tx.send(Broadcast::PresenceDiff(diff));
                    }
                }
            }
            Command::UpdateProfile { client_id, label, color } => {
                if let Some(entry) = self.state.presence.update_profile(client_id, label, color) {
                    if let Some(diff) = presence::diff(vec![], vec![entry], vec![]) {
                        let _ = self.broadcast_tx.send(Broadcast::PresenceDiff(diff));
                    }
                }
            }
            Command::Touch { client_id } => {
                self.state.presence.touch(client_id);
            }
            Command::SetPassword { current, new, reply } => {
                let result = self.handle_set_password(current, new);
                let _ = reply.send(result);
            }
            Command::EvictIdle { idle_ms } => {
                let evicted = self.state.presence.evict_idle(idle_ms);
                if let Some(diff) = presence::diff(vec![], vec![], evicted) {
                    let _ = self.broadcast_tx.send(Broadcast::PresenceDiff(diff));
                }
            }
            Command::IsIdle { reply } => {
                let _ = reply.send(self.state.subscriber_count == 0);
            }
            Command::ProbeRecovery => {
                if self.state.degraded {
                    match self.durability.sync() {
                        Ok(()) => {
                            self.state.degraded = false;
                            info!(%slug, "storage recovered, document no longer degraded");
                        }
                        Err(e) => warn!(%slug, error = %e, "storage still unavailable"),
                    }
                }
            }
        }
    }

    fn handle_subscribe(&mut self, password: Option<String>) -> Result<SubscribeResult, ApplyRejection> {
        let needs_password = self.state.password_hash.is_some();
        if let Some(hash) = &self.state.password_hash {
            match password {
                Some(p) if verify_password(&p, hash) => {}
                _ => return Err(ApplyRejection::Unauthorised),
            }
        }

        let client_id = self.state.next_client_id.fetch_add(1, Ordering::Relaxed);
        self.state.subscriber_count += 1;
        let entry = self.state.presence.join(client_id);
        let mut presence = self.state.presence.snapshot();
        presence.retain(|e| e.client_id != client_id);
        if let Some(diff) = presence::diff(vec![entry], vec![], vec![]) {
            let _ = self.broadcast_tx.send(Broadcast::PresenceDiff(diff));
        }

        Ok(SubscribeResult {
            client_id,
            rev: self.state.rev,
            text: self.state.buffer.text(),
            presence,
            needs_password,
        })
    }

    fn handle_peek(&self, password: Option<String>) -> Result<PeekResult, ApplyRejection> {
        if let Some(hash) = &self.state.password_hash {
            match password {
                Some(p) if verify_password(&p, hash) => {}
                _ => return Err(ApplyRejection::Unauthorised),
            }
        }
        Ok(PeekResult { rev: self.state.rev, text: self.state.buffer.text(), presence: self.state.presence.snapshot() })
    }

    fn handle_apply_edit(&mut self, req: EditCommand, slug: &Slug) -> ApplyOutcome {
        if let Some((rev, ops)) = self.state.dedup.get(req.author_id, req.op_id) {
            return ApplyOutcome::Replayed { rev, transformed_ops: ops };
        }

        if self.state.degraded {
            return ApplyOutcome::Rejected(ApplyRejection::StorageUnavailable);
        }

        if req.base_rev > self.state.rev {
            return ApplyOutcome::Rejected(ApplyRejection::BaseTooOld);
        }
        if self.state.rev - req.base_rev > self.transform_window {
            return ApplyOutcome::Rejected(ApplyRejection::BaseTooOld);
        }

        let history: Vec<AppliedOp> = self
            .state
            .op_log
            .iter()
            .filter(|a| a.rev > req.base_rev)
            .cloned()
            .collect();

        let mut transformed_ops = Vec::with_capacity(req.ops.len());
        let mut working = history.clone();
        let mut virtual_len = self.state.buffer.len();
        let mut virtual_rev = self.state.rev;
        for op in req.ops {
            let split = inkwell_protocol::transform_against_log(op, req.base_rev, &working, &req.author_id);
            for mut op in split {
                op = op.clamp(virtual_len);
                virtual_len = match &op {
                    Operation::Insert { text, .. } => virtual_len + text.chars().count() as u32,
                    Operation::Delete { len, .. } => virtual_len - len,
                };
                virtual_rev += 1;
                working.push(AppliedOp { rev: virtual_rev, op: op.clone(), author_id: req.author_id, op_id: req.op_id, ts: now_ms() });
                transformed_ops.push(op);
            }
        }

        let mut applied_batch = Vec::with_capacity(transformed_ops.len());
        for op in &transformed_ops {
            self.state.buffer.apply(op);
            self.state.presence.transform_cursors(op);
            self.state.rev += 1;
            let applied = AppliedOp { rev: self.state.rev, op: op.clone(), author_id: req.author_id, op_id: req.op_id, ts: now_ms() };
            applied_batch.push(applied);
        }

        for applied in &applied_batch {
            if let Err(e) = self.durability.append(applied) {
                warn!(%slug, error = %e, "failed to append WAL record, marking document degraded");
                self.state.degraded = true;
                return ApplyOutcome::Rejected(ApplyRejection::StorageUnavailable);
            }
        }
        if let Err(e) = self.durability.sync() {
            warn!(%slug, error = %e, "failed to fsync WAL, marking document degraded");
            self.state.degraded = true;
            return ApplyOutcome::Rejected(ApplyRejection::StorageUnavailable);
        }

        for applied in applied_batch {
            self.state.op_log.push_back(applied);
        }
        while self.state.op_log.len() as u64 > self.transform_window {
            self.state.op_log.pop_front();
        }

        self.state.dedup.insert(req.author_id, req.op_id, self.state.rev, transformed_ops.clone());

        let text = self.state.buffer.text();
        match self.durability.maybe_compact(&text, self.state.rev, self.snapshot_threshold, self.snapshot_rev_gap) {
            Ok(true) => info!(%slug, rev = self.state.rev, "compacted snapshot"),
            Ok(false) => {}
            Err(e) => warn!(%slug, error = %e, "snapshot compaction failed"),
        }

        let _ = self.broadcast_tx.send(Broadcast::Applied {
            rev: self.state.rev,
            op_id: req.op_id,
            author_id: req.author_id,
            ops: transformed_ops.clone(),
        });

        ApplyOutcome::Accepted { rev: self.state.rev, transformed_ops }
    }

    fn handle_set_password(&mut self, current: Option<String>, new: Option<String>) -> Result<(), ApplyRejection> {
        if let Some(hash) = &self.state.password_hash {
            match &current {
                Some(p) if verify_password(p, hash) => {}
                _ => return Err(ApplyRejection::Unauthorised),
            }
        }

        let new_hash = match new {
            Some(p) if !p.is_empty() => Some(crate::auth::hash_password(&p).map_err(|_| ApplyRejection::Malformed)?),
            _ => None,
        };
        self.state.password_hash = new_hash.clone();

        let meta = DocumentMeta { password_hash: new_hash, created_ms: self.state.created_ms };
        if let Err(_e) = self.durability.store_meta(&meta) {
            self.state.degraded = true;
            return Err(ApplyRejection::StorageUnavailable);
        }
        Ok(())
    }
}

pub const RETRY_BACKOFF_INITIAL: Duration = Duration::from_millis(250);
pub const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(30);
