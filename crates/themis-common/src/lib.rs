//! Common types, documents, and errors for Themis services.

pub mod error;
pub mod model;
pub mod types;

pub use error::{AppError, AppResult};
pub use model::*;
pub use types::*;
