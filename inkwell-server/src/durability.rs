//! Per-slug durability: an append-only write-ahead log plus periodic full
//! snapshots, with crash-safe recovery.
//!
//! Layout under `<vault>/<slug-as-path>/`:
//! - `snapshot.v1` — JSON `{ text, rev }`.
//! - `wal.v1` — length-prefixed, CRC32C-checksummed applied-op records.
//! - `meta.v1` — JSON `{ password_hash, created_ms }`.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use inkwell_protocol::{AppliedOp, Operation, Slug};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

const SNAPSHOT_FILE: &str = "snapshot.v1";
const WAL_FILE: &str = "wal.v1";
const META_FILE: &str = "meta.v1";

const KIND_INSERT: u8 = 0;
const KIND_DELETE: u8 = 1;

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
struct SnapshotFile {
    text: String,
    rev: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DocumentMeta {
    pub password_hash: Option<String>,
    pub created_ms: u64,
}

impl Default for DocumentMeta {
    fn default() -> Self {
        Self {
            password_hash: None,
            created_ms: now_ms(),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// What recovery found on disk for a slug.
pub struct Recovered {
    pub text: String,
    pub rev: u64,
    pub op_log: Vec<AppliedOp>,
    pub meta: DocumentMeta,
}

pub struct Durability {
    dir: PathBuf,
    wal: std::fs::File,
    wal_bytes: u64,
    snapshot_rev: u64,
}

impl Durability {
    fn slug_dir(vault_root: &Path, slug: &Slug) -> PathBuf {
        let mut dir = vault_root.to_path_buf();
        for segment in slug.as_path_components() {
            dir.push(segment);
        }
        dir
    }

    /// Open (creating if necessary) the durability files for `slug`, and
    /// replay the WAL on top of the snapshot to recover the live state.
    pub async fn open(vault_root: &Path, slug: &Slug, transform_window: u64) -> Result<(Self, Recovered)> {
        let dir = Self::slug_dir(vault_root, slug);
        let dir_clone = dir.clone();
        tokio::task::spawn_blocking(move || Self::open_blocking(dir_clone, transform_window))
            .await
            .context("durability open task panicked")?
    }

    fn open_blocking(dir: PathBuf, transform_window: u64) -> Result<(Self, Recovered)> {
        std::fs::create_dir_all(&dir).context("creating document directory")?;

        let snapshot_path = dir.join(SNAPSHOT_FILE);
        let snapshot = if snapshot_path.exists() {
            let data = std::fs::read(&snapshot_path).context("reading snapshot")?;
            serde_json::from_slice(&data).context("parsing snapshot")?
        } else {
            SnapshotFile::default()
        };

        let meta_path = dir.join(META_FILE);
        let meta = if meta_path.exists() {
            let data = std::fs::read(&meta_path).context("reading meta")?;
            serde_json::from_slice(&data).context("parsing meta")?
        } else {
            DocumentMeta::default()
        };

        let wal_path = dir.join(WAL_FILE);
        let mut wal = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&wal_path)
            .context("opening wal")?;

        let (replayed, valid_len) = replay(&mut wal, snapshot.rev)?;
        if valid_len < wal.metadata()?.len() {
            warn!(
                path = %wal_path.display(),
                "truncating WAL after first invalid record at byte {valid_len}"
            );
            wal.set_len(valid_len)?;
            wal.seek(SeekFrom::End(0))?;
        }

        let mut text = snapshot.text;
        let mut rev = snapshot.rev;
        for applied in &replayed {
            text = inkwell_protocol::apply(&text, &applied.op);
            rev = applied.rev;
        }

        let mut op_log = replayed;
        if op_log.len() as u64 > transform_window {
            let drop = op_log.len() - transform_window as usize;
            op_log.drain(0..drop);
        }

        let wal_bytes = wal.metadata()?.len();
        Ok((
            Self { dir, wal, wal_bytes, snapshot_rev: snapshot.rev },
            Recovered { text, rev, op_log, meta },
        ))
    }

    /// Append one applied operation to the WAL. Does not fsync; callers
    /// batch several appends and call [`Durability::sync`] once.
    pub fn append(&mut self, applied: &AppliedOp) -> Result<()> {
        let record = encode_record(applied);
        self.wal.write_all(&record)?;
        self.wal_bytes += record.len() as u64;
        Ok(())
    }

    /// Fsync the WAL file descriptor. An `ack` must not be sent until this
    /// returns successfully.
    pub fn sync(&mut self) -> Result<()> {
        self.wal.sync_data()?;
        Ok(())
    }

    pub fn store_meta(&self, meta: &DocumentMeta) -> Result<()> {
        let data = serde_json::to_vec_pretty(meta)?;
        std::fs::write(self.dir.join(META_FILE), data)?;
        Ok(())
    }

    /// Compact if the WAL has grown past `snapshot_threshold` bytes or the
    /// revision gap since the last snapshot exceeds the configured bound.
    pub fn maybe_compact(&mut self, text: &str, rev: u64, snapshot_threshold: u64, rev_gap: u64) -> Result<bool> {
        if self.wal_bytes <= snapshot_threshold && rev - self.snapshot_rev <= rev_gap {
            return Ok(false);
        }
        self.compact(text, rev)?;
        Ok(true)
    }

    fn compact(&mut self, text: &str, rev: u64) -> Result<()> {
        let snapshot = SnapshotFile { text: text.to_string(), rev };
        let data = serde_json::to_vec(&snapshot)?;

        let tmp_path = self.dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        {
            let mut tmp = std::fs::File::create(&tmp_path)?;
            tmp.write_all(&data)?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, self.dir.join(SNAPSHOT_FILE))?;

        self.wal.set_len(0)?;
        self.wal.seek(SeekFrom::Start(0))?;
        self.wal_bytes = 0;
        self.snapshot_rev = rev;
        Ok(())
    }
}

fn encode_record(applied: &AppliedOp) -> Vec<u8> {
    let mut body = Vec::with_capacity(64);
    body.extend_from_slice(&applied.rev.to_le_bytes());
    body.extend_from_slice(applied.author_id.as_bytes());
    body.extend_from_slice(applied.op_id.as_bytes());
    body.extend_from_slice(&applied.ts.to_le_bytes());
    match &applied.op {
        Operation::Insert { pos, text } => {
            body.push(KIND_INSERT);
            body.extend_from_slice(&pos.to_le_bytes());
            let bytes = text.as_bytes();
            body.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            body.extend_from_slice(bytes);
        }
        Operation::Delete { pos, len } => {
            body.push(KIND_DELETE);
            body.extend_from_slice(&pos.to_le_bytes());
            body.extend_from_slice(&len.to_le_bytes());
        }
    }

    let crc = crc32c::crc32c(&body);
    let mut record = Vec::with_capacity(body.len() + 8);
    record.extend_from_slice(&(body.len() as u32).to_le_bytes());
    record.extend_from_slice(&crc.to_le_bytes());
    record.extend_from_slice(&body);
    record
}

/// Read every valid record from `wal`, stopping at the first checksum
/// failure, length overrun, or out-of-sequence revision. Returns the
/// records read and the byte offset of the last valid record's end, so the
/// caller can truncate trailing garbage.
fn replay(wal: &mut std::fs::File, snapshot_rev: u64) -> Result<(Vec<AppliedOp>, u64)> {
    wal.seek(SeekFrom::Start(0))?;
    let mut data = Vec::new();
    wal.read_to_end(&mut data)?;

    let mut records = Vec::new();
    let mut offset = 0usize;
    let mut last_rev = snapshot_rev;

    while offset + 8 <= data.len() {
        let len = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(data[offset + 4..offset + 8].try_into().unwrap());
        let body_start = offset + 8;
        let body_end = body_start + len;
        if body_end > data.len() {
            break;
        }
        let body = &data[body_start..body_end];
        if crc32c::crc32c(body) != crc {
            warn!(offset, "WAL record failed checksum");
            break;
        }
        match decode_body(body) {
            Ok(applied) if applied.rev == last_rev + 1 => {
                last_rev = applied.rev;
                records.push(applied);
                offset = body_end;
            }
            Ok(applied) => {
                warn!(expected = last_rev + 1, found = applied.rev, "WAL record out of sequence");
                break;
            }
            Err(e) => {
                warn!(offset, error = %e, "WAL record failed to decode");
                break;
            }
        }
    }

    Ok((records, offset as u64))
}

fn decode_body(body: &[u8]) -> Result<AppliedOp> {
    if body.len() < 8 + 16 + 16 + 8 + 1 {
        bail!("WAL record body too short");
    }
    let mut cursor = 0;
    let rev = u64::from_le_bytes(body[cursor..cursor + 8].try_into()?);
    cursor += 8;
    let author_id = Uuid::from_slice(&body[cursor..cursor + 16])?;
    cursor += 16;
    let op_id = Uuid::from_slice(&body[cursor..cursor + 16])?;
    cursor += 16;
    let ts = u64::from_le_bytes(body[cursor..cursor + 8].try_into()?);
    cursor += 8;
    let kind = body[cursor];
    cursor += 1;

    let op = match kind {
        KIND_INSERT => {
            if body.len() < cursor + 8 {
                bail!("insert record truncated");
            }
            let pos = u32::from_le_bytes(body[cursor..cursor + 4].try_into()?);
            cursor += 4;
            let text_len = u32::from_le_bytes(body[cursor..cursor + 4].try_into()?) as usize;
            cursor += 4;
            if body.len() < cursor + text_len {
                bail!("insert text truncated");
            }
            let text = String::from_utf8(body[cursor..cursor + text_len].to_vec())?;
            Operation::Insert { pos, text }
        }
        KIND_DELETE => {
            if body.len() < cursor + 8 {
                bail!("delete record truncated");
            }
            let pos = u32::from_le_bytes(body[cursor..cursor + 4].try_into()?);
            cursor += 4;
            let len = u32::from_le_bytes(body[cursor..cursor + 4].try_into()?);
            Operation::Delete { pos, len }
        }
        other => bail!("unknown op kind {other}"),
    };

    Ok(AppliedOp { rev, op, author_id, op_id, ts })
}
