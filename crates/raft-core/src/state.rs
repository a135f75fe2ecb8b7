//! # state
//!
//! why: pin down the byte format of the state that must survive a crash
//! relations: produced and restored by node.rs, stored as an opaque blob by raft-storage
//! what: PersistentState (term, vote, log) with a json codec

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::log::Log;
use crate::message::NodeId;

/// The three fields Raft requires to be durable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub log: Log,
}

/// Borrowed view with the same field layout, so persisting never clones the log.
#[derive(Serialize)]
pub(crate) struct PersistentStateRef<'a> {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub log: &'a Log,
}

impl PersistentStateRef<'_> {
    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(RaftError::Encode)
    }
}

impl PersistentState {
    pub fn encode(&self) -> Result<Vec<u8>> {
        PersistentStateRef {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: &self.log,
        }
        .encode()
    }

    /// Decode a stored blob. An empty blob means the peer never persisted
    /// anything and yields `None`; anything unreadable is an error.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>> {
        if bytes.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(bytes)
            .map(Some)
            .map_err(|e| RaftError::CorruptState(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogEntry;

    #[test]
    fn empty_blob_is_fresh_start() {
        assert_eq!(PersistentState::decode(&[]).unwrap(), None);
    }

    #[test]
    fn restart_sees_identical_state() {
        let mut log = Log::new();
        log.append(LogEntry::new(1, b"a".to_vec()));
        log.append(LogEntry::new(3, b"b".to_vec()));
        let state = PersistentState {
            current_term: 3,
            voted_for: Some(2),
            log,
        };

        let restored = PersistentState::decode(&state.encode().unwrap()).unwrap();

        assert_eq!(restored, Some(state));
    }

    #[test]
    fn truncated_blob_fails_loudly() {
        let state = PersistentState {
            current_term: 1,
            voted_for: None,
            log: Log::new(),
        };
        let bytes = state.encode().unwrap();

        let err = PersistentState::decode(&bytes[..bytes.len() / 2]).unwrap_err();

        assert!(matches!(err, RaftError::CorruptState(_)));
    }

    #[test]
    fn log_without_sentinel_is_corrupt() {
        let bytes = br#"{"current_term":2,"voted_for":null,"log":[{"term":2,"command":[]}]}"#;
        assert!(matches!(
            PersistentState::decode(bytes),
            Err(RaftError::CorruptState(_))
        ));
    }
}
