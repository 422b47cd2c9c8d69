//! Per-node storage service for a distributed blob/tag filesystem.
//!
//! The hard part lives in [`coordinator`]: the admission queues, the tag
//! index, and the volume registry it serializes access to. Everything
//! else — [`layout`], [`volume`], [`queue`], [`tag_index`], [`monitor`],
//! [`config`], [`http`] — is a supporting collaborator around that
//! single-threaded serialization point.

pub mod config;
pub mod coordinator;
pub mod errors;
pub mod http;
pub mod layout;
pub mod monitor;
pub mod queue;
pub mod tag_index;
pub mod volume;
