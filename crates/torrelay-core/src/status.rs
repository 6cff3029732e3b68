//! Table-driven normalization of vendor status vocabularies.
//!
//! # Design
//!
//! - Each vendor ships one ordered `&'static [StatusRule]`; the first matching
//!   rule wins, so specific prefixes must precede broader ones.
//! - Matching is case-insensitive on the trimmed raw value.
//! - Unknown values never regress a job: they keep the current canonical status.

use tracing::warn;

use crate::model::ProviderStatus;

/// How a rule matches a raw vendor status.
#[derive(Debug, Clone, Copy)]
pub enum StatusMatcher {
    /// Exact (case-insensitive) equality.
    Exact(&'static str),
    /// Raw value starts with the given prefix.
    Prefix(&'static str),
    /// Raw value contains the given fragment.
    Contains(&'static str),
    /// Arbitrary predicate over the lowercased raw value.
    Predicate(fn(&str) -> bool),
}

impl StatusMatcher {
    fn matches(&self, normalized: &str) -> bool {
        match self {
            Self::Exact(value) => normalized == *value,
            Self::Prefix(prefix) => normalized.starts_with(prefix),
            Self::Contains(fragment) => normalized.contains(fragment),
            Self::Predicate(predicate) => predicate(normalized),
        }
    }
}

/// One `(matcher, canonical status)` pair.
#[derive(Debug, Clone, Copy)]
pub struct StatusRule {
    /// Matcher applied to the normalized raw status.
    pub matcher: StatusMatcher,
    /// Canonical status produced on match.
    pub status: ProviderStatus,
}

impl StatusRule {
    /// Exact-match rule.
    #[must_use]
    pub const fn exact(value: &'static str, status: ProviderStatus) -> Self {
        Self {
            matcher: StatusMatcher::Exact(value),
            status,
        }
    }

    /// Prefix rule.
    #[must_use]
    pub const fn prefix(value: &'static str, status: ProviderStatus) -> Self {
        Self {
            matcher: StatusMatcher::Prefix(value),
            status,
        }
    }

    /// Substring rule.
    #[must_use]
    pub const fn contains(value: &'static str, status: ProviderStatus) -> Self {
        Self {
            matcher: StatusMatcher::Contains(value),
            status,
        }
    }

    /// Predicate rule.
    #[must_use]
    pub const fn predicate(predicate: fn(&str) -> bool, status: ProviderStatus) -> Self {
        Self {
            matcher: StatusMatcher::Predicate(predicate),
            status,
        }
    }
}

/// Ordered status table for one vendor.
#[derive(Debug, Clone, Copy)]
pub struct StatusTable {
    vendor: &'static str,
    rules: &'static [StatusRule],
}

impl StatusTable {
    /// Wrap a vendor's rule list.
    #[must_use]
    pub const fn new(vendor: &'static str, rules: &'static [StatusRule]) -> Self {
        Self { vendor, rules }
    }

    /// Vendor label used in diagnostics.
    #[must_use]
    pub const fn vendor(&self) -> &'static str {
        self.vendor
    }

    /// First matching canonical status, if any rule matches.
    #[must_use]
    pub fn lookup(&self, raw: &str) -> Option<ProviderStatus> {
        let normalized = raw.trim().to_ascii_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matcher.matches(&normalized))
            .map(|rule| rule.status)
    }

    /// Resolve a raw status, keeping `current` (or `Processing` when unset) for
    /// values the table does not know.
    #[must_use]
    pub fn resolve(&self, raw: &str, current: Option<ProviderStatus>) -> ProviderStatus {
        if let Some(status) = self.lookup(raw) {
            return status;
        }
        let fallback = current.unwrap_or(ProviderStatus::Processing);
        warn!(
            vendor = self.vendor,
            raw_status = raw,
            fallback = ?fallback,
            "unmapped provider status"
        );
        fallback
    }
}
