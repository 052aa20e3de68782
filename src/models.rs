//! Public models shared between the core and the HTTP surface.
//!
//! These mirror what the dataset user properties hold; the dataset tree is
//! the authority and these structs are decoded views of it.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::names::{wire_ts, wire_ts_opt};
use crate::resource::ClonePoolSpec;

/// A clone as presented to clients: the dataset plus its connection info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicClone {
    pub name: String,
    pub resource: String,
    pub owner: String,
    #[serde(with = "wire_ts")]
    pub created_at: NaiveDateTime,
    #[serde(with = "wire_ts")]
    pub snapped_at: NaiveDateTime,
    #[serde(default, with = "wire_ts_opt", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<NaiveDateTime>,
    pub clone_pooled: bool,
    pub healthy: bool,
    /// Published proxy port on the server.
    pub port: u16,
    /// Address of the server hosting the clone.
    pub server: String,
    /// Port of the zdap API on that server.
    pub api_port: u16,
}

/// Lifecycle of a pooled clone, derived from `{expires_at, healthy}` at read
/// time; never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneState {
    Available,
    Claimed,
    Expired,
    Unhealthy,
}

impl PublicClone {
    pub fn state(&self, now: NaiveDateTime) -> CloneState {
        if !self.healthy {
            return CloneState::Unhealthy;
        }
        match self.expires_at {
            None => CloneState::Available,
            Some(at) if at <= now => CloneState::Expired,
            Some(_) => CloneState::Claimed,
        }
    }

    /// Unclaimed and healthy: claimable by the pool scheduler.
    pub fn available(&self) -> bool {
        self.expires_at.is_none() && self.healthy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicSnap {
    pub name: String,
    pub resource: String,
    #[serde(with = "wire_ts")]
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicResource {
    pub name: String,
    #[serde(default)]
    pub alias: String,
    pub clone_pool: ClonePoolSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerStatus {
    pub address: String,
    pub resources: Vec<String>,
    pub resource_details: BTreeMap<String, ServerResourceDetails>,
    pub snaps: usize,
    pub clones: usize,
    pub free_disk: u64,
    pub used_disk: u64,
    pub total_disk: u64,
    pub free_mem: u64,
    pub used_mem: u64,
    pub cached_mem: u64,
    pub total_mem: u64,
    pub load_1: f64,
    pub load_5: f64,
    pub load_15: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerResourceDetails {
    pub name: String,
    pub pooled_clones_available: i64,
}
