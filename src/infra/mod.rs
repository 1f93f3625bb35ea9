pub mod error;
pub mod git;
pub mod locks;
pub mod store;
pub mod telemetry;
pub mod worktree;
