//! API request/response types

use serde::{Deserialize, Serialize};

use crate::models::{PublicClone, PublicSnap};
use crate::resource::ClonePoolSpec;

/// A snapshot together with the caller's clones of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapDetail {
    #[serde(flatten)]
    pub snap: PublicSnap,
    pub clones: Vec<PublicClone>,
}

/// A resource with its snapshots, as listed to one caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDetail {
    pub name: String,
    #[serde(default)]
    pub alias: String,
    pub clone_pool: ClonePoolSpec,
    pub snaps: Vec<SnapDetail>,
}

#[derive(Debug, Deserialize)]
pub struct ClaimQuery {
    /// Claim duration in seconds; the resource's default when absent.
    pub ttl: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiSuccess {
    pub message: String,
}

/// Result of a bulk clone destroy.
#[derive(Debug, Serialize, Deserialize)]
pub struct DestroyedClones {
    pub destroyed: Vec<String>,
}
