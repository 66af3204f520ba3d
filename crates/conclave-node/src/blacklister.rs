//! Peer and client blacklisting.

use std::collections::{HashMap, HashSet};

use conclave_consensus::SuspicionCode;

/// Tracks misbehaving peers or clients by name.
#[derive(Debug)]
pub struct SimpleBlacklister {
    label: String,
    blacklisted: HashSet<String>,
    suspicion_counts: HashMap<String, u32>,
}

impl SimpleBlacklister {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            blacklisted: HashSet::new(),
            suspicion_counts: HashMap::new(),
        }
    }

    pub fn blacklist(&mut self, name: &str) {
        if self.blacklisted.insert(name.to_string()) {
            tracing::info!(blacklister = %self.label, name, "blacklisted");
        }
    }

    pub fn is_blacklisted(&self, name: &str) -> bool {
        self.blacklisted.contains(name)
    }

    /// Records a suspicion; blacklists when the code is in the known
    /// table. Returns whether the name ended up blacklisted.
    pub fn report_suspicion(&mut self, name: &str, code: SuspicionCode) -> bool {
        let count = self.suspicion_counts.entry(name.to_string()).or_insert(0);
        *count += 1;
        tracing::warn!(
            blacklister = %self.label,
            name,
            code = %code,
            count = *count,
            "suspicion recorded"
        );
        if code.is_blacklistable() {
            self.blacklist(name);
        }
        self.is_blacklisted(name)
    }

    pub fn suspicion_count(&self, name: &str) -> u32 {
        self.suspicion_counts.get(name).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blacklisting_is_sticky() {
        let mut bl = SimpleBlacklister::new("test");
        assert!(!bl.is_blacklisted("Mallory"));
        bl.blacklist("Mallory");
        bl.blacklist("Mallory");
        assert!(bl.is_blacklisted("Mallory"));
        assert!(!bl.is_blacklisted("Alice"));
    }

    #[test]
    fn known_suspicion_codes_blacklist() {
        let mut bl = SimpleBlacklister::new("test");
        assert!(bl.report_suspicion("Mallory", SuspicionCode::DuplicatePprSent));
        assert!(bl.is_blacklisted("Mallory"));
        assert_eq!(bl.suspicion_count("Mallory"), 1);
    }
}
