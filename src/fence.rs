//! Fence values.

use std::fmt;

/// A point on one queue's fence timeline.
///
/// Values handed out by a queue strictly increase from 1. "No value yet"
/// is expressed as `Option<FenceValue>::None` rather than a magic number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FenceValue(u64);

impl FenceValue {
    /// The first value a fresh queue assigns.
    pub const FIRST: Self = Self(1);

    /// Wrap a raw value. Zero is the initial (never signalled) fence state
    /// and is not a valid assignment.
    pub fn new(value: u64) -> Option<Self> {
        (value != 0).then_some(Self(value))
    }

    /// The raw counter.
    pub fn get(self) -> u64 {
        self.0
    }

    /// The value following this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for FenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_is_not_a_value() {
        assert_eq!(FenceValue::new(0), None);
        assert_eq!(FenceValue::new(1), Some(FenceValue::FIRST));
    }

    #[test]
    fn test_values_order() {
        let a = FenceValue::FIRST;
        let b = a.next();
        assert!(b > a);
        assert_eq!(b.get(), 2);
    }
}
