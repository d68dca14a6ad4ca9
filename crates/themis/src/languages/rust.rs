//! Rust language toolchain

use super::Toolchain;

/// Get toolchain for Rust
pub fn toolchain() -> Toolchain {
    Toolchain::compiled(
        "solution.rs",
        &["rustc", "-O", "--edition", "2021", "-o", "solution", "solution.rs"],
        &["{build}/solution"],
    )
}
