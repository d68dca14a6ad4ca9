//! Go language toolchain

use super::Toolchain;

/// Get toolchain for Go
///
/// The Go runtime reserves far more virtual memory than it touches, so the
/// address space ceiling is left off and only resident memory is enforced.
pub fn toolchain() -> Toolchain {
    Toolchain::compiled(
        "solution.go",
        &["go", "build", "-o", "solution", "solution.go"],
        &["{build}/solution"],
    )
    .with_env("GOCACHE", "{build}/.gocache")
    .with_env("HOME", "{build}")
    .without_address_space_limit()
}
