//! Transaction log records

use crate::common::NodeId;
use crate::storage::{OpKind, Statement};
use serde::{Deserialize, Serialize};

pub type EntryId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TxStatus {
    Pending,
    Committed,
    Failed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "PENDING",
            TxStatus::Committed => "COMMITTED",
            TxStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxStatus::Pending)
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logged write against one target node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxEntry {
    pub id: EntryId,
    pub seq: u64,
    pub kind: OpKind,
    pub target: NodeId,
    /// Statement operation name
    pub statement: String,
    /// Statement parameters as JSON text
    pub params: String,
    pub status: TxStatus,
    pub error: Option<String>,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
    pub updated_at: u64,
    /// Entry this one replays
    pub replay_of: Option<EntryId>,
    /// Seq of the first entry in the replay chain
    pub origin_seq: u64,
    /// `created_at` of the first entry in the replay chain
    pub origin_created_at: u64,
}

impl TxEntry {
    /// Rebuild the logged statement
    pub fn to_statement(&self) -> crate::Result<Statement> {
        Statement::from_parts(&self.statement, &self.params)
            .map_err(|e| crate::Error::LogCorrupted(format!("entry {}: {}", self.id, e)))
    }

    pub fn is_replay(&self) -> bool {
        self.replay_of.is_some()
    }
}
