//! Crash-safe persistence.
//!
//! Two kinds of files live under the state directory:
//! - `attempts.jsonl`: append-only redemption attempt log, one JSON object
//!   per line. A torn final line is skipped on read.
//! - `positions.json` / `orders.json`: current-status snapshots, replaced
//!   atomically via a temp file and rename.
//!
//! Recovery loads the snapshot and replays any attempt whose sequence number
//! is newer than the snapshot.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::redemption::types::RedemptionAttempt;
use crate::trading::order::Order;
use crate::trading::position::Position;

const ATTEMPTS_FILE: &str = "attempts.jsonl";
const POSITIONS_FILE: &str = "positions.json";
const ORDERS_FILE: &str = "orders.json";

/// One line of the attempt log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Position the attempt belongs to.
    pub condition_id: String,
    /// Monotonic sequence number across the log.
    pub seq: u64,
    /// The attempt.
    pub attempt: RedemptionAttempt,
}

/// Position snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionSnapshot {
    /// Highest attempt sequence reflected in `positions`.
    pub last_attempt_seq: u64,
    /// Active positions.
    pub positions: Vec<Position>,
}

struct AttemptLog {
    file: File,
    next_seq: u64,
}

/// File-backed state store.
pub struct Store {
    dir: PathBuf,
    log: Mutex<AttemptLog>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("dir", &self.dir).finish()
    }
}

impl Store {
    /// Open (or create) a store in `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let path = dir.join(ATTEMPTS_FILE);
        let next_seq = read_attempts_at(&path)?
            .last()
            .map(|r| r.seq + 1)
            .unwrap_or(1);

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if ends_mid_line(&path)? {
            warn!(path = %path.display(), "Attempt log ends mid-line, terminating it");
            file.write_all(b"\n")?;
        }
        info!(dir = %dir.display(), next_seq, "State store opened");

        Ok(Self {
            dir,
            log: Mutex::new(AttemptLog { file, next_seq }),
        })
    }

    /// State directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append an attempt and flush it to disk. Returns its sequence number.
    pub fn append_attempt(
        &self,
        condition_id: &str,
        attempt: &RedemptionAttempt,
    ) -> Result<u64, StoreError> {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        let record = AttemptRecord {
            condition_id: condition_id.to_string(),
            seq: log.next_seq,
            attempt: attempt.clone(),
        };

        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        log.file.write_all(line.as_bytes())?;
        log.file.sync_data()?;
        log.next_seq += 1;

        debug!(condition_id, seq = record.seq, outcome = %attempt.outcome, "Attempt logged");
        Ok(record.seq)
    }

    /// Every readable attempt record, in log order.
    pub fn read_attempts(&self) -> Result<Vec<AttemptRecord>, StoreError> {
        read_attempts_at(&self.dir.join(ATTEMPTS_FILE))
    }

    /// Replace the position snapshot.
    pub fn save_positions(&self, snapshot: &PositionSnapshot) -> Result<(), StoreError> {
        write_atomic(&self.dir.join(POSITIONS_FILE), snapshot)
    }

    /// Load the position snapshot, if one exists.
    pub fn load_positions(&self) -> Result<Option<PositionSnapshot>, StoreError> {
        read_json(&self.dir.join(POSITIONS_FILE))
    }

    /// Replace the order snapshot.
    pub fn save_orders(&self, orders: &[Order]) -> Result<(), StoreError> {
        write_atomic(&self.dir.join(ORDERS_FILE), &orders)
    }

    /// Load the order snapshot.
    pub fn load_orders(&self) -> Result<Vec<Order>, StoreError> {
        Ok(read_json(&self.dir.join(ORDERS_FILE))?.unwrap_or_default())
    }
}

fn read_attempts_at(path: &Path) -> Result<Vec<AttemptRecord>, StoreError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AttemptRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(line = number + 1, error = %e, "Skipping unreadable attempt record"),
        }
    }
    Ok(records)
}

fn ends_mid_line(path: &Path) -> Result<bool, StoreError> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

fn write_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
