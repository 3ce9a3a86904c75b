//! Version information for `--version` output.

/// The crate version, with git describe information appended when the
/// build happened inside a git checkout (provided by build.rs).
pub fn version_string() -> String {
    match option_env!("PMETER_GIT_DESCRIBE") {
        Some(describe) => format!("{} ({})", env!("CARGO_PKG_VERSION"), describe),
        None => env!("CARGO_PKG_VERSION").to_string(),
    }
}
