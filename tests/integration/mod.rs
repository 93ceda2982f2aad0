//! End-to-end tests: merge runs over small on-disk checkpoints, error paths
//! and the command-line binary.

mod cli_tests;
mod error_tests;
mod workflow_tests;

/// Common test initialization
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("lora_merge=debug")
        .try_init();
}
