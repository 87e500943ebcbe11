//! Tenant (environment) identifiers.

use std::fmt;
use uuid::Uuid;

/// Length of the canonical hyphenated UUID form.
const CANONICAL_LEN: usize = 36;

/// Identifier of a tenant environment, as it appears in node-facing URLs.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvId(Uuid);

impl EnvId {
    /// Parse a URL path segment.
    ///
    /// Only the canonical hyphenated form is accepted (`8-4-4-4-12` hex
    /// digits). Braced, URN and simple forms are rejected so that the same
    /// tenant is never reachable through two different URLs.
    pub fn parse(s: &str) -> crate::Result<Self> {
        if s.len() != CANONICAL_LEN {
            return Err(crate::Error::InvalidEnvironmentId(s.to_string()));
        }
        let well_formed = s.char_indices().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_hexdigit(),
        });
        if !well_formed {
            return Err(crate::Error::InvalidEnvironmentId(s.to_string()));
        }
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidEnvironmentId(format!("{s}: {e}")))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvId({})", self.0)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonical() {
        let id = EnvId::parse("6f1c8b0e-4a0b-4c55-9a7e-3f0b8d1e2c4a").unwrap();
        assert_eq!(id.to_string(), "6f1c8b0e-4a0b-4c55-9a7e-3f0b8d1e2c4a");
    }

    #[test]
    fn test_parse_accepts_uppercase() {
        let id = EnvId::parse("6F1C8B0E-4A0B-4C55-9A7E-3F0B8D1E2C4A").unwrap();
        assert_eq!(id.to_string(), "6f1c8b0e-4a0b-4c55-9a7e-3f0b8d1e2c4a");
    }

    #[test]
    fn test_parse_rejects_other_forms() {
        for bad in [
            "",
            "dev",
            "6f1c8b0e4a0b4c559a7e3f0b8d1e2c4a",
            "{6f1c8b0e-4a0b-4c55-9a7e-3f0b8d1e2c4a}",
            "urn:uuid:6f1c8b0e-4a0b-4c55-9a7e-3f0b8d1e2c4a",
            "6f1c8b0e-4a0b-4c55-9a7e-3f0b8d1e2c4g",
            "6f1c8b0e_4a0b-4c55-9a7e-3f0b8d1e2c4a",
            "../../../../../../../../../etc/passwd",
        ] {
            assert!(EnvId::parse(bad).is_err(), "{bad} should be rejected");
        }
    }
}
