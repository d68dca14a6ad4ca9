//! C++ language toolchain

use super::Toolchain;

/// Get toolchain for C++
pub fn toolchain() -> Toolchain {
    Toolchain::compiled(
        "solution.cpp",
        &["g++", "-O2", "-std=c++20", "-pipe", "-o", "solution", "solution.cpp"],
        &["{build}/solution"],
    )
}
