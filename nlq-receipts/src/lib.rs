//! Append-only, hash-chained audit log of execution decisions (JSON lines).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ReceiptError {
    #[error("io error: {0}")]
    Io(String),
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("hash chain broken at line {line}: {message}")]
    Chain { line: usize, message: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptAction {
    /// Statement ran; reads are closed, modifying statements hold a transaction.
    Execute,
    AwaitConfirmation,
    Commit,
    Rollback,
    Reject,
}

impl fmt::Display for ReceiptAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReceiptAction::Execute => "execute",
            ReceiptAction::AwaitConfirmation => "await_confirmation",
            ReceiptAction::Commit => "commit",
            ReceiptAction::Rollback => "rollback",
            ReceiptAction::Reject => "reject",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub receipt_id: Uuid,
    pub timestamp: String,
    pub request_id: Option<Uuid>,
    pub action: ReceiptAction,
    /// Risk level or outcome label the decision was based on.
    pub decision: String,
    pub sql_hash: String,
    #[serde(default)]
    pub detail: String,
    pub prev_hash: Option<String>,
    pub chain_hash: String,
}

impl Receipt {
    pub fn new(action: ReceiptAction, sql: &str, decision: impl Into<String>) -> Self {
        Self {
            receipt_id: Uuid::new_v4(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            request_id: None,
            action,
            decision: decision.into(),
            sql_hash: sha256_hex(sql),
            detail: String::new(),
            prev_hash: None,
            chain_hash: String::new(),
        }
    }

    pub fn with_request(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

pub fn sha256_hex(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

pub struct ReceiptLog {
    path: PathBuf,
    last_hash: Mutex<Option<String>>,
}

impl ReceiptLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReceiptError> {
        let path = path.as_ref().to_path_buf();
        let last_hash = read_receipts(&path)?.pop().map(|r| r.chain_hash);
        Ok(Self {
            path,
            last_hash: Mutex::new(last_hash),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Chain `receipt` onto the log and return the stored form.
    pub fn append(&self, mut receipt: Receipt) -> Result<Receipt, ReceiptError> {
        let mut last = self.last_hash.lock().map_err(|_| ReceiptError::Io("lock".into()))?;
        receipt.prev_hash = last.clone();
        receipt.chain_hash = hash_receipt(&receipt);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ReceiptError::Io(e.to_string()))?;
        let line = serde_json::to_string(&receipt).map_err(|e| ReceiptError::Parse {
            line: 0,
            message: e.to_string(),
        })?;
        writeln!(file, "{line}").map_err(|e| ReceiptError::Io(e.to_string()))?;
        *last = Some(receipt.chain_hash.clone());
        Ok(receipt)
    }

    /// Last `n` receipts, oldest first.
    pub fn tail(&self, n: usize) -> Result<Vec<Receipt>, ReceiptError> {
        let mut all = read_receipts(&self.path)?;
        let skip = all.len().saturating_sub(n);
        Ok(all.split_off(skip))
    }
}

/// Check every link of the chain. Returns the number of receipts verified.
pub fn verify_log(path: impl AsRef<Path>) -> Result<usize, ReceiptError> {
    let receipts = read_receipts(path.as_ref())?;
    let mut prev: Option<String> = None;
    for (i, receipt) in receipts.iter().enumerate() {
        let line = i + 1;
        if receipt.prev_hash != prev {
            return Err(ReceiptError::Chain {
                line,
                message: "prev_hash does not match preceding receipt".into(),
            });
        }
        if receipt.chain_hash != hash_receipt(receipt) {
            return Err(ReceiptError::Chain {
                line,
                message: "chain_hash does not match contents".into(),
            });
        }
        prev = Some(receipt.chain_hash.clone());
    }
    Ok(receipts.len())
}

fn hash_receipt(receipt: &Receipt) -> String {
    let mut h = Sha256::new();
    h.update(receipt.receipt_id.to_string());
    h.update(&receipt.timestamp);
    if let Some(id) = receipt.request_id {
        h.update(id.to_string());
    }
    h.update(receipt.action.to_string());
    h.update(&receipt.decision);
    h.update(&receipt.sql_hash);
    h.update(&receipt.detail);
    if let Some(prev) = &receipt.prev_hash {
        h.update(prev);
    }
    hex::encode(h.finalize())
}

fn read_receipts(path: &Path) -> Result<Vec<Receipt>, ReceiptError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).map_err(|e| ReceiptError::Io(e.to_string()))?;
    let reader = BufReader::new(file);
    let mut out = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| ReceiptError::Io(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        let receipt: Receipt = serde_json::from_str(&line).map_err(|e| ReceiptError::Parse {
            line: i + 1,
            message: e.to_string(),
        })?;
        out.push(receipt);
    }
    Ok(out)
}
