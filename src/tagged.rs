//! Sequence-tagged values
//!
//! Every element that crosses a thread boundary inside a run carries the
//! sequence id the producer assigned to it. The same wrapper is used for
//! input elements on their way to the workers and for transformed results on
//! their way to the reducer.

/// A value tagged with its position in the original source order.
///
/// A tagged value without a payload is the terminal marker: its sequence id
/// is the total number of real elements that came before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tagged<V> {
    value: Option<V>,
    seq: u64,
}
impl<V> Tagged<V> {
    /// Wraps a real element
    #[must_use]
    pub fn new(value: V, seq: u64) -> Self {
        Self {
            value: Some(value),
            seq,
        }
    }

    /// Creates the terminal marker that follows `count` real elements
    #[must_use]
    pub fn terminal(count: u64) -> Self {
        Self {
            value: None,
            seq: count,
        }
    }

    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.value.is_none()
    }

    #[must_use]
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// Splits the tag into its sequence id and payload
    pub fn into_parts(self) -> (u64, Option<V>) {
        (self.seq, self.value)
    }
}
