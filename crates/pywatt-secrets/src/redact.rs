//! Process-global redaction registry.
//!
//! Every secret value handed to a caller is registered here before it can
//! appear in a log line. [`redact`] replaces each occurrence of a
//! registered value with `[REDACTED]` using an Aho–Corasick matcher, so a
//! call costs O(text + matches) regardless of how many values are
//! registered. The matcher is rebuilt lazily on the first `redact` after
//! a registration change.
//!
//! [`RedactingStderr`] wires the registry into the logging stack: handed
//! to `tracing-subscriber` as the writer, it scrubs every emitted line on
//! its way to stderr.

use std::collections::BTreeSet;
use std::io::{self, Write};
use std::sync::{OnceLock, RwLock};

use aho_corasick::AhoCorasick;
use tracing::error;

/// Replacement text for registered values.
pub const REDACTED_PLACEHOLDER: &str = "[REDACTED]";

/// Values shorter than this are never registered: single characters and
/// tiny fragments would redact almost everything.
pub const MIN_PATTERN_LEN: usize = 4;

static REGISTRY: OnceLock<RedactionRegistry> = OnceLock::new();

/// Returns the process-global registry.
pub fn registry() -> &'static RedactionRegistry {
    REGISTRY.get_or_init(RedactionRegistry::new)
}

/// Registers a sensitive value with the global registry.
pub fn register(value: &str) {
    registry().register(value);
}

/// Removes a value from the global registry.
pub fn unregister(value: &str) {
    registry().unregister(value);
}

/// Redacts all registered values in `text`.
#[must_use]
pub fn redact(text: &str) -> String {
    registry().redact(text)
}

struct Inner {
    patterns: BTreeSet<String>,
    /// Compiled matcher; `None` after a registration change until the
    /// next `redact` rebuilds it.
    matcher: Option<AhoCorasick>,
}

/// A set of sensitive strings with an Aho–Corasick scrubber.
pub struct RedactionRegistry {
    inner: RwLock<Inner>,
}

impl Default for RedactionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RedactionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                patterns: BTreeSet::new(),
                matcher: None,
            }),
        }
    }

    /// Registers a sensitive value. Values shorter than
    /// [`MIN_PATTERN_LEN`] bytes are ignored.
    pub fn register(&self, value: &str) {
        if value.len() < MIN_PATTERN_LEN {
            return;
        }
        let mut inner = lock_write(&self.inner);
        if inner.patterns.insert(value.to_owned()) {
            inner.matcher = None;
        }
    }

    /// Removes a value from the registry.
    pub fn unregister(&self, value: &str) {
        let mut inner = lock_write(&self.inner);
        if inner.patterns.remove(value) {
            inner.matcher = None;
        }
    }

    /// Number of registered values.
    #[must_use]
    pub fn len(&self) -> usize {
        lock_read(&self.inner).patterns.len()
    }

    /// Whether no values are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock_read(&self.inner).patterns.is_empty()
    }

    /// Replaces every occurrence of any registered value with
    /// [`REDACTED_PLACEHOLDER`].
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        {
            let inner = lock_read(&self.inner);
            if inner.patterns.is_empty() {
                return text.to_owned();
            }
            if let Some(matcher) = &inner.matcher {
                return replace_all(matcher, text);
            }
        }

        // Rebuild under the write lock, then scan.
        let mut inner = lock_write(&self.inner);
        if inner.matcher.is_none() {
            match AhoCorasick::new(&inner.patterns) {
                Ok(matcher) => inner.matcher = Some(matcher),
                Err(e) => {
                    error!(error = %e, "failed to build redaction matcher");
                    return text.to_owned();
                }
            }
        }
        match &inner.matcher {
            Some(matcher) => replace_all(matcher, text),
            None => text.to_owned(),
        }
    }
}

fn replace_all(matcher: &AhoCorasick, text: &str) -> String {
    let replacements = vec![REDACTED_PLACEHOLDER; matcher.patterns_len()];
    matcher.replace_all(text, &replacements)
}

fn lock_read<'a>(lock: &'a RwLock<Inner>) -> std::sync::RwLockReadGuard<'a, Inner> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn lock_write<'a>(lock: &'a RwLock<Inner>) -> std::sync::RwLockWriteGuard<'a, Inner> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// An `io::Write` that scrubs output through the global registry before
/// writing it to stderr.
///
/// Hand a closure producing this to `tracing_subscriber`'s `with_writer`;
/// each formatted event arrives as one write call and leaves redacted.
#[derive(Debug, Default, Clone, Copy)]
pub struct RedactingStderr;

impl RedactingStderr {
    /// Creates the writer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Write for RedactingStderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        let scrubbed = registry().redact(&text);
        io::stderr().write_all(scrubbed.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests build their own registries; the global one is shared
    // across the test binary and would leak patterns between cases.

    #[test]
    fn registered_value_is_replaced() {
        let registry = RedactionRegistry::new();
        registry.register("postgres://u:p@h/db");

        let line = "connecting to postgres://u:p@h/db";
        assert_eq!(registry.redact(line), "connecting to [REDACTED]");
    }

    #[test]
    fn every_occurrence_is_replaced() {
        let registry = RedactionRegistry::new();
        registry.register("hunter2");

        let line = "pass=hunter2 confirm=hunter2";
        let redacted = registry.redact(line);
        assert_eq!(redacted, "pass=[REDACTED] confirm=[REDACTED]");
        assert!(!redacted.contains("hunter2"));
    }

    #[test]
    fn multiple_patterns_in_one_pass() {
        let registry = RedactionRegistry::new();
        registry.register("alpha-token");
        registry.register("beta-token");

        let redacted = registry.redact("a=alpha-token b=beta-token");
        assert_eq!(redacted, "a=[REDACTED] b=[REDACTED]");
    }

    #[test]
    fn short_values_are_ignored() {
        let registry = RedactionRegistry::new();
        registry.register("ab");
        registry.register("xyz");

        assert!(registry.is_empty());
        assert_eq!(registry.redact("ab xyz"), "ab xyz");
    }

    #[test]
    fn unregister_stops_redaction() {
        let registry = RedactionRegistry::new();
        registry.register("old-secret-value");
        assert_eq!(registry.redact("old-secret-value"), "[REDACTED]");

        registry.unregister("old-secret-value");
        assert_eq!(registry.redact("old-secret-value"), "old-secret-value");
    }

    #[test]
    fn matcher_rebuilds_after_registration_change() {
        let registry = RedactionRegistry::new();
        registry.register("first-secret");
        // Force a build.
        assert_eq!(registry.redact("first-secret"), "[REDACTED]");

        // Mutate and confirm the next call sees the new pattern.
        registry.register("second-secret");
        assert_eq!(
            registry.redact("first-secret second-secret"),
            "[REDACTED] [REDACTED]"
        );
    }

    #[test]
    fn empty_registry_is_passthrough() {
        let registry = RedactionRegistry::new();
        assert_eq!(registry.redact("nothing to hide"), "nothing to hide");
    }

    #[test]
    fn global_registry_roundtrip() {
        register("global-test-secret-value");
        let redacted = redact("found global-test-secret-value here");
        assert_eq!(redacted, "found [REDACTED] here");
        unregister("global-test-secret-value");
    }
}
