//! # buildsync
//!
//! Umbrella crate re-exporting the buildsync workspace members.

pub use buildsync_core as core;
pub use buildsync_sdk as sdk;
pub use buildsync_server as server;
