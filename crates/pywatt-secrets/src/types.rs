//! Core types for secret values.

use std::fmt;
use std::str::FromStr;

use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::SecretError;

/// A secret value with automatic memory zeroisation.
///
/// The value is stored as a `SecretString`, which prevents accidental
/// logging and zeroes the memory when dropped. Equality is constant-time.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretValue {
    #[zeroize(skip)]
    inner: SecretString,
}

impl SecretValue {
    /// Creates a new secret value from a string.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            inner: SecretString::from(value.into()),
        }
    }

    /// Exposes the secret for use.
    ///
    /// The returned reference must not be logged or stored; the redaction
    /// registry only protects log output, not arbitrary sinks.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.inner.expose_secret()
    }

    /// Length of the secret in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.expose_secret().len()
    }

    /// Whether the secret is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.expose_secret().is_empty()
    }

    /// Parses the string form into `T`.
    pub fn parse<T>(&self, name: &str) -> Result<T, SecretError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.expose().parse().map_err(|e: T::Err| SecretError::Parse {
            name: name.to_owned(),
            target: std::any::type_name::<T>(),
            reason: e.to_string(),
        })
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl PartialEq for SecretValue {
    /// Constant-time comparison to prevent timing attacks.
    fn eq(&self, other: &Self) -> bool {
        let self_bytes = self.inner.expose_secret().as_bytes();
        let other_bytes = other.inner.expose_secret().as_bytes();

        if self_bytes.len() != other_bytes.len() {
            return false;
        }

        self_bytes.ct_eq(other_bytes).into()
    }
}

impl Eq for SecretValue {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_is_redacted() {
        let value = SecretValue::new("super-secret");
        let debug = format!("{value:?}");
        assert_eq!(debug, "[REDACTED]");
        assert!(!debug.contains("super-secret"));
    }

    #[test]
    fn expose_returns_value() {
        let value = SecretValue::new("super-secret");
        assert_eq!(value.expose(), "super-secret");
        assert_eq!(value.len(), 12);
        assert!(!value.is_empty());
    }

    #[test]
    fn constant_time_equality() {
        let a = SecretValue::new("correct_password_12345");
        let b = SecretValue::new("correct_password_12345");
        assert_eq!(a, b);

        let c = SecretValue::new("wrong_password__12345");
        assert_ne!(a, c);

        let short = SecretValue::new("short");
        assert_ne!(a, short);
    }

    #[test]
    fn parse_typed_values() {
        let port = SecretValue::new("8443");
        let parsed: u16 = port.parse("PORT").unwrap();
        assert_eq!(parsed, 8443);

        let flag = SecretValue::new("true");
        let parsed: bool = flag.parse("FLAG").unwrap();
        assert!(parsed);
    }

    #[test]
    fn parse_failure_names_secret_and_type() {
        let value = SecretValue::new("not-a-number");
        let result: Result<u16, _> = value.parse("DB_POOL_SIZE");

        match result {
            Err(SecretError::Parse { name, target, .. }) => {
                assert_eq!(name, "DB_POOL_SIZE");
                assert_eq!(target, "u16");
            }
            other => panic!("expected Parse error, got {other:?}"),
        }
    }
}
