//! Compiled regex patterns for registry fields and path heuristics.
//!
//! These patterns are compiled once on first use and reused throughout
//! the crate.

use once_cell::sync::Lazy;
use regex::Regex;

// ═══════════════════════════════════════════════════════════════════════════════
// Registry Fields
// ═══════════════════════════════════════════════════════════════════════════════

/// `session_` followed by exactly 8 lowercase hex characters.
pub static RE_SESSION_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^session_[0-9a-f]{8}$").unwrap());

pub static RE_PID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[1-9][0-9]{0,9}$").unwrap());

// ═══════════════════════════════════════════════════════════════════════════════
// Orphan Heuristics
// ═══════════════════════════════════════════════════════════════════════════════

/// System temp locations on Linux and macOS.
pub static RE_TEMP_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(/tmp|/var/tmp|/private/tmp|/private/var/folders|/var/folders|/dev/shm)(/|$)")
        .unwrap()
});

/// A path component named like a test fixture: `test`, `tests`, `test-foo`,
/// `foo_test`, `tmp.test123`, ...
pub static RE_TEST_FIXTURE_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(^|/)([^/]*[._-])?tests?([._-][^/]*|[0-9]+)?(/|$)").unwrap());
