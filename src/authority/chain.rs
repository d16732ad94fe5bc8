//! Contract for the external tamper-evident log, plus an in-memory SHA-256 chain.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Hash that precedes the first link of every chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("tamper-evident log unavailable: {0}")]
    Unavailable(String),

    #[error("failed to encode chain payload: {0}")]
    Encoding(String),
}

/// Receipt for an appended link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReceipt {
    pub hash: String,
    pub sequence: u64,
}

/// Result of verifying a build's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub broken_at_sequence: Option<u64>,
    pub length: u64,
}

/// An append-only hash chain per build.
#[async_trait]
pub trait TamperEvidentLog: Send + Sync {
    async fn append_to_chain(&self, build_id: &str, event_type: &str, payload: &Value) -> Result<ChainReceipt, ChainError>;

    async fn verify_chain(&self, build_id: &str) -> Result<ChainVerification, ChainError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    pub sequence: u64,
    pub event_type: String,
    pub payload: String,
    pub prev_hash: String,
    pub hash: String,
}

fn link_hash(prev_hash: &str, sequence: u64, event_type: &str, payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(sequence.to_be_bytes());
    hasher.update(event_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

/// SHA-256 linked chain held in memory.
#[derive(Debug, Default)]
pub struct MemoryHashChain {
    chains: Mutex<HashMap<String, Vec<ChainLink>>>,
}

impl MemoryHashChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of a build's links.
    pub fn links(&self, build_id: &str) -> Vec<ChainLink> {
        let chains = self.chains.lock().unwrap_or_else(PoisonError::into_inner);
        chains.get(build_id).cloned().unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn tamper(&self, build_id: &str, sequence: u64, payload: &str) {
        let mut chains = self.chains.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(link) = chains
            .get_mut(build_id)
            .and_then(|links| links.iter_mut().find(|link| link.sequence == sequence))
        {
            link.payload = payload.to_string();
        }
    }
}

#[async_trait]
impl TamperEvidentLog for MemoryHashChain {
    async fn append_to_chain(&self, build_id: &str, event_type: &str, payload: &Value) -> Result<ChainReceipt, ChainError> {
        let payload = serde_json::to_string(payload).map_err(|err| ChainError::Encoding(err.to_string()))?;
        let mut chains = self.chains.lock().unwrap_or_else(PoisonError::into_inner);
        let links = chains.entry(build_id.to_string()).or_default();

        let prev_hash = links
            .last()
            .map(|link| link.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let sequence = links.len() as u64 + 1;
        let hash = link_hash(&prev_hash, sequence, event_type, &payload);
        links.push(ChainLink {
            sequence,
            event_type: event_type.to_string(),
            payload,
            prev_hash,
            hash: hash.clone(),
        });

        Ok(ChainReceipt { hash, sequence })
    }

    async fn verify_chain(&self, build_id: &str) -> Result<ChainVerification, ChainError> {
        let links = self.links(build_id);
        let mut prev_hash = GENESIS_HASH.to_string();
        for (index, link) in links.iter().enumerate() {
            let expected_sequence = index as u64 + 1;
            let recomputed = link_hash(&prev_hash, link.sequence, &link.event_type, &link.payload);
            if link.sequence != expected_sequence || link.prev_hash != prev_hash || link.hash != recomputed {
                return Ok(ChainVerification {
                    valid: false,
                    broken_at_sequence: Some(expected_sequence),
                    length: links.len() as u64,
                });
            }
            prev_hash = link.hash.clone();
        }

        Ok(ChainVerification {
            valid: true,
            broken_at_sequence: None,
            length: links.len() as u64,
        })
    }
}
