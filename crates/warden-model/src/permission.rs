//! ---
//! warden_section: "04-domain-model"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Permission domain types and error taxonomy."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AuthzError;

/// Single right out of the fixed four-bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Right {
    Read,
    Write,
    Execute,
    Administrate,
}

impl Right {
    pub const ALL: [Right; 4] = [Right::Read, Right::Write, Right::Execute, Right::Administrate];

    pub fn as_char(&self) -> char {
        match self {
            Right::Read => 'r',
            Right::Write => 'w',
            Right::Execute => 'x',
            Right::Administrate => 'a',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'r' => Some(Right::Read),
            'w' => Some(Right::Write),
            'x' => Some(Right::Execute),
            'a' => Some(Right::Administrate),
            _ => None,
        }
    }
}

/// Permission record held per principal key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionBits {
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub write: bool,
    #[serde(default)]
    pub execute: bool,
    #[serde(default)]
    pub administrate: bool,
}

impl PermissionBits {
    pub const fn none() -> Self {
        Self {
            read: false,
            write: false,
            execute: false,
            administrate: false,
        }
    }

    pub const fn all() -> Self {
        Self {
            read: true,
            write: true,
            execute: true,
            administrate: true,
        }
    }

    pub fn has(&self, right: Right) -> bool {
        match right {
            Right::Read => self.read,
            Right::Write => self.write,
            Right::Execute => self.execute,
            Right::Administrate => self.administrate,
        }
    }

    pub fn set(&mut self, right: Right, value: bool) {
        match right {
            Right::Read => self.read = value,
            Right::Write => self.write = value,
            Right::Execute => self.execute = value,
            Right::Administrate => self.administrate = value,
        }
    }

    pub fn with(mut self, right: Right) -> Self {
        self.set(right, true);
        self
    }

    pub fn union(self, other: PermissionBits) -> Self {
        Self {
            read: self.read || other.read,
            write: self.write || other.write,
            execute: self.execute || other.execute,
            administrate: self.administrate || other.administrate,
        }
    }

    pub fn is_empty(&self) -> bool {
        !Right::ALL.iter().any(|right| self.has(*right))
    }

    /// True when every bit set in `other` is also set here.
    pub fn contains(&self, other: PermissionBits) -> bool {
        Right::ALL
            .iter()
            .all(|right| !other.has(*right) || self.has(*right))
    }

    pub fn rights(&self) -> impl Iterator<Item = Right> + '_ {
        Right::ALL.into_iter().filter(|right| self.has(*right))
    }
}

impl fmt::Display for PermissionBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for right in self.rights() {
            write!(f, "{}", right.as_char())?;
        }
        Ok(())
    }
}

impl FromStr for PermissionBits {
    type Err = AuthzError;

    /// Parses the compact `rwxa` form. Order is free; duplicates, unknown
    /// characters and empty strings are rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AuthzError::invalid("empty permission string"));
        }
        let mut bits = PermissionBits::none();
        for c in s.chars() {
            let right = Right::from_char(c).ok_or_else(|| {
                AuthzError::invalid(format!("unknown permission character '{c}' in '{s}'"))
            })?;
            if bits.has(right) {
                return Err(AuthzError::invalid(format!(
                    "duplicate permission character '{c}' in '{s}'"
                )));
            }
            bits.set(right, true);
        }
        Ok(bits)
    }
}

/// Set of rights a check must satisfy; never empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PermissionRequest(PermissionBits);

impl PermissionRequest {
    pub fn new(bits: PermissionBits) -> Result<Self, AuthzError> {
        if bits.is_empty() {
            return Err(AuthzError::invalid("permission request must name at least one right"));
        }
        Ok(Self(bits))
    }

    pub fn single(right: Right) -> Self {
        Self(PermissionBits::none().with(right))
    }

    pub fn administrate() -> Self {
        Self::single(Right::Administrate)
    }

    pub fn bits(&self) -> PermissionBits {
        self.0
    }

    pub fn rights(&self) -> impl Iterator<Item = Right> + '_ {
        self.0.rights()
    }

    /// True when `effective` holds every requested right.
    pub fn is_satisfied_by(&self, effective: PermissionBits) -> bool {
        effective.contains(self.0)
    }
}

impl FromStr for PermissionRequest {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PermissionRequest::new(s.parse()?)
    }
}

impl TryFrom<String> for PermissionRequest {
    type Error = AuthzError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PermissionRequest> for String {
    fn from(value: PermissionRequest) -> Self {
        value.to_string()
    }
}

impl fmt::Display for PermissionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_in_any_order() {
        let bits: PermissionBits = "ar".parse().unwrap();
        assert!(bits.read && bits.administrate);
        assert!(!bits.write && !bits.execute);
        assert_eq!(bits.to_string(), "ra");
        assert_eq!("rwxa".parse::<PermissionBits>().unwrap(), PermissionBits::all());
    }

    #[test]
    fn rejects_malformed_strings() {
        for raw in ["", "rr", "rq", "R", "r w"] {
            let err = raw.parse::<PermissionBits>().unwrap_err();
            assert_eq!(err.kind(), "invalid_input", "{raw}");
        }
    }

    #[test]
    fn containment_is_per_bit() {
        let held: PermissionBits = "rx".parse().unwrap();
        assert!(held.contains("r".parse().unwrap()));
        assert!(held.contains("xr".parse().unwrap()));
        assert!(!held.contains("rw".parse().unwrap()));
        assert!(held.contains(PermissionBits::none()));
    }

    #[test]
    fn request_serializes_as_compact_string() {
        let request: PermissionRequest = "wr".parse().unwrap();
        assert_eq!(serde_json::to_string(&request).unwrap(), "\"rw\"");
        let back: PermissionRequest = serde_json::from_str("\"a\"").unwrap();
        assert_eq!(back, PermissionRequest::administrate());
        assert!(serde_json::from_str::<PermissionRequest>("\"\"").is_err());
    }
}
