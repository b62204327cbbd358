//! # buildsync-server
//!
//! HTTP surface over the buildsync engine: version history, rollback, bulk
//! appends and git pull/push. Also runs the idle-build finalization sweep.

pub mod api;
pub mod server;
pub mod sweeper;

pub use api::{create_router, ApiError, AppState};
pub use server::BuildsyncServer;
pub use sweeper::spawn_sweeper;
