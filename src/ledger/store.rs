//! JSON snapshot persistence for the proposal ledger
//!
//! The snapshot is rewritten after every committed mutation so identical ids
//! reload into identical status across restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ProposalLedger;
use crate::domain::Proposal;
use crate::error::{MayaError, Result};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct LedgerSnapshot {
    version: u32,
    saved_at: DateTime<Utc>,
    proposals: Vec<Proposal>,
}

/// File-backed ledger snapshot. Clones share one write lock.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored ledger, `None` when no snapshot exists yet
    pub async fn load(&self) -> Result<Option<ProposalLedger>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No ledger snapshot at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: LedgerSnapshot = serde_json::from_slice(&raw)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(MayaError::Validation(format!(
                "unsupported ledger snapshot version {} in {}",
                snapshot.version,
                self.path.display()
            )));
        }

        let ledger = ProposalLedger::from_proposals(snapshot.proposals)?;
        info!(
            "Loaded {} proposals from {}",
            ledger.len(),
            self.path.display()
        );
        Ok(Some(ledger))
    }

    /// Write the ledger atomically (temp file + rename). Saves through the
    /// same store are serialized; each one writes its own temp file.
    pub async fn save(&self, ledger: &ProposalLedger) -> Result<()> {
        let snapshot = LedgerSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            proposals: ledger.all().to_vec(),
        };
        let body = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let _guard = self.write_lock.lock().await;
        let tmp = self
            .path
            .with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
        let written = match tokio::fs::write(&tmp, body).await {
            Ok(()) => tokio::fs::rename(&tmp, &self.path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                warn!("Could not remove {}: {}", tmp.display(), cleanup);
            }
            return Err(e.into());
        }

        debug!(
            "Saved {} proposals to {}",
            ledger.len(),
            self.path.display()
        );
        Ok(())
    }
}
