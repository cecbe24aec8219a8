//! Secret values that must never reach logs in full.

use std::fmt;

/// Placeholder inserted between the visible ends of a masked value.
pub const MASK_PLACEHOLDER: &str = "...";

/// Rendering used for values too short to reveal any characters of.
pub const FULLY_MASKED: &str = "***";

/// Number of characters kept visible at each end of a masked value.
const VISIBLE_CHARS: usize = 4;

/// Values shorter than this are fully masked.
const MIN_PARTIAL_MASK_LEN: usize = 12;

/// Masks a credential for diagnostics, keeping the first and last four
/// characters (`AKIAEXAMPLE1234` becomes `AKIA...1234`).
///
/// Values shorter than twelve characters are rendered as `***`.
#[must_use]
pub fn mask(value: &str) -> String {
    let len = value.chars().count();
    if len < MIN_PARTIAL_MASK_LEN {
        return FULLY_MASKED.to_string();
    }
    let head: String = value.chars().take(VISIBLE_CHARS).collect();
    let tail: String = value.chars().skip(len - VISIBLE_CHARS).collect();
    format!("{head}{MASK_PLACEHOLDER}{tail}")
}

/// An opaque credential (access key, secret key, registry token).
///
/// Both [`fmt::Display`] and [`fmt::Debug`] print the masked form; the raw
/// value is only reachable through [`Secret::expose`].
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wraps a raw credential.
    #[must_use]
    pub const fn new(value: String) -> Self {
        Self(value)
    }

    /// Returns the raw value. Only pass this to the client that needs it.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns the masked rendering of the value.
    #[must_use]
    pub fn masked(&self) -> String {
        mask(&self.0)
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Secret").field(&self.masked()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_middle_of_long_values() {
        assert_eq!(mask("AKIAEXAMPLE1234"), "AKIA...1234");
        let masked = mask("secretkey1234567890abcdefghijklmnopqrstuvwxyz");
        assert_eq!(masked, "secr...wxyz");
        assert!(!masked.contains("1234567890"));
    }

    #[test]
    fn fully_masks_short_values() {
        assert_eq!(mask(""), "***");
        assert_eq!(mask("short"), "***");
        assert_eq!(mask("elevenchars"), "***");
    }

    #[test]
    fn masks_by_character_not_byte() {
        assert_eq!(mask("ééééxxxxxxxxüüüü"), "éééé...üüüü");
    }

    #[test]
    fn display_and_debug_never_show_raw_value() {
        let secret = Secret::new("AKIAEXAMPLE1234".to_string());
        assert_eq!(secret.to_string(), "AKIA...1234");
        let debug = format!("{secret:?}");
        assert!(!debug.contains("EXAMPLE"));
        assert_eq!(secret.expose(), "AKIAEXAMPLE1234");
    }
}
