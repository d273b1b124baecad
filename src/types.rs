//! NewType wrappers for strings that must not be mixed up.
//!
//! A unit label and a checksum tag are both plain strings on the wire, but
//! passing one where the other is expected is always a bug.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Generates a string NewType with the usual conversions.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

newtype_string!(
    /// Human-readable execution unit identity (e.g. "unit-7").
    ///
    /// Appears in log lines and in workspace directory names.
    UnitLabel
);

newtype_string!(
    /// Algorithm-tagged content digest, e.g. "sha256:9f86d08...".
    Checksum
);

impl UnitLabel {
    /// Label for the unit with the given numeric id.
    pub fn for_unit(id: usize) -> Self {
        Self(format!("unit-{id}"))
    }
}

impl Checksum {
    /// Split into `(algorithm, hex_digest)`.
    ///
    /// An untagged value is treated as a bare digest with no algorithm.
    pub fn parts(&self) -> (Option<&str>, &str) {
        match self.0.split_once(':') {
            Some((algorithm, digest)) => (Some(algorithm), digest),
            None => (None, self.0.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_label() {
        let label = UnitLabel::for_unit(12);
        assert_eq!(label.as_str(), "unit-12");
        assert_eq!(label.to_string(), "unit-12");
    }

    #[test]
    fn test_checksum_parts() {
        let tagged = Checksum::new("sha256:abcd");
        assert_eq!(tagged.parts(), (Some("sha256"), "abcd"));

        let bare = Checksum::new("abcd");
        assert_eq!(bare.parts(), (None, "abcd"));
    }

    #[test]
    fn test_checksum_serde_transparent() {
        let checksum = Checksum::new("sha256:00ff");
        let json = serde_json::to_string(&checksum).unwrap();
        assert_eq!(json, "\"sha256:00ff\"");
    }
}
