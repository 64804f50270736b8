//! Stable exit codes for the gauntlet CLI.

/// The run finished and its overall status is SUCCESS.
pub const OK: i32 = 0;
/// The pipeline ran (fully or partially) and the overall status is FAILURE.
pub const FAILED: i32 = 1;
/// The run aborted before any pipeline step (config, input, or environment error).
pub const ABORTED: i32 = 2;
