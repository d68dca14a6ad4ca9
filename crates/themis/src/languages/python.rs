//! Python language toolchain

use super::Toolchain;

/// Get toolchain for Python
pub fn toolchain() -> Toolchain {
    Toolchain::interpreted("solution.py", &["python3", "-S", "{build}/solution.py"])
}
