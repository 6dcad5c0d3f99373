//! Redacting wrapper and preview masking for sensitive values

use std::fmt;
use zeroize::Zeroize;

/// Number of leading characters kept by [`mask_secret`].
const PREVIEW_CHARS: usize = 6;

/// Sensitive value - redacted in Debug/Display/logs, zeroized on drop
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Masked preview of a secret for listings: the first few characters
/// followed by `...`. Values too short to mask safely collapse to `***`.
pub fn mask_secret(value: &str) -> String {
    if value.chars().count() <= PREVIEW_CHARS * 2 {
        return "***".to_string();
    }
    let prefix: String = value.chars().take(PREVIEW_CHARS).collect();
    format!("{prefix}...")
}
