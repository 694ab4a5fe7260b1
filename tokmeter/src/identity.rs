//! Caller identity resolution.
//!
//! Every developer is issued one upstream API key, stored in one of a fixed number of
//! environment slots (`DEV1_CLAUDE_KEY` .. `DEV8_CLAUDE_KEY`). The proxy attributes a request to
//! a developer by comparing the presented `x-api-key` against those slots.
//!
//! The table is read once at startup and never changes afterwards, so it is shared between
//! request tasks behind an `Arc` without any locking.
//!
//! Resolution never fails: a key that matches no slot resolves to [`CallerIdentity::Unknown`]
//! and the request is still forwarded and metered.

use serde::{Serialize, Serializer};
use std::fmt;

/// Number of credential slots read from the environment.
pub const CREDENTIAL_SLOTS: u8 = 8;

/// Environment variable holding the credential for a slot (1-based).
pub fn slot_env_var(slot: u8) -> String {
    format!("DEV{slot}_CLAUDE_KEY")
}

/// The developer a request is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallerIdentity {
    /// Matched credential slot, 1-based
    Developer(u8),
    Unknown,
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallerIdentity::Developer(slot) => write!(f, "dev{slot}"),
            CallerIdentity::Unknown => f.write_str("unknown"),
        }
    }
}

impl Serialize for CallerIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Immutable slot -> credential table.
///
/// Slots are kept in scan order. An empty slot (variable unset or set to the empty string)
/// never matches anything.
#[derive(Clone, Default)]
pub struct CredentialMap {
    slots: Vec<(u8, String)>,
}

// Credentials must never end up in logs, so Debug only reports which slots are populated.
impl fmt::Debug for CredentialMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialMap")
            .field("configured_slots", &self.configured_slots())
            .finish()
    }
}

impl CredentialMap {
    /// Build the table from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the table using `lookup` to fetch each slot's variable by name.
    pub fn from_lookup<F>(mut lookup: F) -> Self
    where
        F: FnMut(&str) -> Option<String>,
    {
        let slots = (1..=CREDENTIAL_SLOTS)
            .map(|slot| (slot, lookup(&slot_env_var(slot)).unwrap_or_default()))
            .collect();
        Self { slots }
    }

    /// Build the table from explicit slot values, in slot order starting at 1.
    ///
    /// Values past [`CREDENTIAL_SLOTS`] are ignored.
    pub fn from_slots<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let slots = (1..=CREDENTIAL_SLOTS).zip(values.into_iter().map(Into::into)).collect();
        Self { slots }
    }

    /// Resolve a presented credential to the developer it belongs to.
    ///
    /// Scans slots in ascending order and returns the first exact match, so if two slots hold
    /// the same key the lower slot wins.
    pub fn resolve(&self, credential: &str) -> CallerIdentity {
        if credential.is_empty() {
            return CallerIdentity::Unknown;
        }

        self.slots
            .iter()
            .find(|(_, stored)| !stored.is_empty() && stored == credential)
            .map(|(slot, _)| CallerIdentity::Developer(*slot))
            .unwrap_or(CallerIdentity::Unknown)
    }

    /// Number of slots holding a non-empty credential
    pub fn configured_slots(&self) -> usize {
        self.slots.iter().filter(|(_, stored)| !stored.is_empty()).count()
    }
}
