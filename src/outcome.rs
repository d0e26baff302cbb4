//! Final result of a protected call.

use crate::error::Failure;

/// What a protected call ended with: a value, nothing, or a failure.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The call (or a fallback) produced a value.
    Value(T),

    /// The call completed without a value.
    Empty,

    /// The call failed and no fallback recovered it.
    Failed(Failure),
}

impl<T> Outcome<T> {
    pub(crate) fn from_option(value: Option<T>) -> Self {
        match value {
            Some(value) => Outcome::Value(value),
            None => Outcome::Empty,
        }
    }

    /// The value, if there is one.
    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Value(value) => Some(value),
            _ => None,
        }
    }

    /// The failure, if there is one.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Outcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    /// Returns true if the outcome holds a value.
    pub fn has_value(&self) -> bool {
        matches!(self, Outcome::Value(_))
    }

    /// Returns true if the outcome holds a failure.
    pub fn has_failure(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    /// Returns true if the call completed without a value.
    pub fn is_empty(&self) -> bool {
        matches!(self, Outcome::Empty)
    }

    /// Takes the value out, dropping any failure.
    pub fn into_value(self) -> Option<T> {
        match self {
            Outcome::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Converts into a `Result`; an empty outcome is `Ok(None)`.
    pub fn into_result(self) -> Result<Option<T>, Failure> {
        match self {
            Outcome::Value(value) => Ok(Some(value)),
            Outcome::Empty => Ok(None),
            Outcome::Failed(failure) => Err(failure),
        }
    }
}

impl<T> From<Result<T, Failure>> for Outcome<T> {
    fn from(result: Result<T, Failure>) -> Self {
        match result {
            Ok(value) => Outcome::Value(value),
            Err(failure) => Outcome::Failed(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_and_failure_are_exclusive() {
        let value = Outcome::Value(3);
        assert!(value.has_value());
        assert!(!value.has_failure());
        assert_eq!(value.value(), Some(&3));
        assert!(value.failure().is_none());

        let failed: Outcome<u32> = Outcome::Failed(Failure::Panicked("x".into()));
        assert!(failed.has_failure());
        assert!(!failed.has_value());
        assert!(failed.value().is_none());
    }

    #[test]
    fn empty_has_neither() {
        let empty = Outcome::<u32>::from_option(None);
        assert!(empty.is_empty());
        assert!(!empty.has_value());
        assert!(!empty.has_failure());
        assert_eq!(empty.into_result().unwrap(), None);
    }
}
