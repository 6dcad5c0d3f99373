//! Shared types for the zai gateway workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::{Secret, mask_secret};
