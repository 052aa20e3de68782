//! zdap - copy-on-write database cloning service
//!
//! Maintains per-resource base datasets on a copy-on-write filesystem,
//! snapshots them on a schedule, and hands out cheap writable clones with a
//! database container and TCP proxy attached. A per-resource pool keeps
//! pre-warmed clones ready to claim.
//!
//! All authoritative state lives in dataset names and user properties plus
//! the set of running containers; a restarted daemon reconstructs everything
//! by listing datasets.

pub mod api;
pub mod bases;
pub mod cloning;
pub mod clonepool;
pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod names;
pub mod registry;
pub mod resource;
pub mod service;
pub mod status;
pub mod storage;

pub use api::{build_router, Server};
pub use config::Config;
pub use error::{Error, Result};
pub use models::{PublicClone, PublicResource, PublicSnap, ServerStatus};
pub use resource::{load_resources, ClonePoolSpec, Resource};
pub use service::Service;
pub use storage::{MemStorage, Storage, ZfsStorage};
pub use engine::{ContainerEngine, DockerEngine, MemEngine};
