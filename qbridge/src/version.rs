//! Version information for qbridge.

/// Bridge version from Cargo.toml
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Git revision baked in at build time, if the build set it.
pub fn git_sha() -> &'static str {
    option_env!("QBRIDGE_GIT_SHA").unwrap_or("unknown")
}
