//! Store key derivation.
//!
//! Keys must stay stable across restarts: a limiter that derives a different
//! key for the same scope and identifier silently forgets every counter and
//! block written before it.

use crate::store::KeyPattern;

const ATTEMPTS: &str = "attempts";
const BLOCKED: &str = "blocked";

/// The pair of store keys tracking one identifier within one scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimitKeys {
    /// Attempt counter key: `<prefix>:attempts:<scope>:<identifier>`
    pub attempts: String,
    /// Block flag key: `<prefix>:blocked:<scope>:<identifier>`
    pub blocked: String,
}

impl LimitKeys {
    pub fn new(prefix: &str, scope: &str, identifier: &str) -> Self {
        Self {
            attempts: format!("{}:{}:{}:{}", prefix, ATTEMPTS, scope, identifier),
            blocked: format!("{}:{}:{}:{}", prefix, BLOCKED, scope, identifier),
        }
    }

    /// Both keys, for deletes.
    pub fn to_vec(&self) -> Vec<String> {
        vec![self.attempts.clone(), self.blocked.clone()]
    }
}

/// Scan patterns matching every attempt counter and block flag of `scope`.
///
/// One pattern per key kind, each anchored on the literal
/// `<prefix>:<kind>:<scope>:` so identifiers that happen to contain
/// `:<scope>:` under another scope are not swept up.
pub fn scope_patterns(prefix: &str, scope: &str) -> [KeyPattern; 2] {
    [
        KeyPattern::prefixed(format!("{}:{}:{}:", prefix, ATTEMPTS, scope)),
        KeyPattern::prefixed(format!("{}:{}:{}:", prefix, BLOCKED, scope)),
    ]
}
