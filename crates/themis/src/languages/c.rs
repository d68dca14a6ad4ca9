//! C language toolchain

use super::Toolchain;

/// Get toolchain for C
pub fn toolchain() -> Toolchain {
    Toolchain::compiled(
        "solution.c",
        &["gcc", "-O2", "-std=c17", "-pipe", "-o", "solution", "solution.c", "-lm"],
        &["{build}/solution"],
    )
}
