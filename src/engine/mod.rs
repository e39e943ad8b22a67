//! Client-side synchronization engine.
//!
//! A [`session::SyncSession`] owns one [`stream::EventStreamClient`], one
//! [`snapshot::SnapshotFetcher`] and the [`registry::StateReconciler`], and
//! drives all three from a single task so the registry has exactly one writer.

use serde::Deserialize;
use serde_json::Value;

use crate::files::api::{FileId, ScanStatus};

pub mod registry;
pub mod session;
pub mod snapshot;
pub mod stream;
pub mod ws;

/// Incremental status update pushed by the backend for one file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusDelta {
    pub file_id: FileId,
    pub status: ScanStatus,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
}

/// Inbound channel message after parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Keepalive,
    Delta(StatusDelta),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolAnomaly {
    #[error("file {id}: status moved backwards from {from} to {to}")]
    StatusRegression {
        id: FileId,
        from: ScanStatus,
        to: ScanStatus,
    },
    #[error("file {id}: already {from}, refusing change to {to}")]
    TerminalRewrite {
        id: FileId,
        from: ScanStatus,
        to: ScanStatus,
    },
    #[error("malformed status message: {reason}")]
    Malformed { reason: String },
}

pub fn pong_message() -> String {
    serde_json::json!({ "type": "pong" }).to_string()
}

/// Classify one text frame from the status channel.
pub fn parse_message(text: &str) -> Result<Inbound, ProtocolAnomaly> {
    let value: Value = serde_json::from_str(text).map_err(|err| ProtocolAnomaly::Malformed {
        reason: err.to_string(),
    })?;

    if let Some(kind) = value.get("type") {
        return match kind.as_str() {
            Some("ping") => Ok(Inbound::Keepalive),
            Some(other) => Err(ProtocolAnomaly::Malformed {
                reason: format!("unsupported message type '{other}'"),
            }),
            None => Err(ProtocolAnomaly::Malformed {
                reason: "message type is not a string".to_string(),
            }),
        };
    }

    serde_json::from_value(value)
        .map(Inbound::Delta)
        .map_err(|err| ProtocolAnomaly::Malformed {
            reason: err.to_string(),
        })
}
