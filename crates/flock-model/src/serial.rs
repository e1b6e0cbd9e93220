/// The global change serial.
///
/// Every mutator that actually changes a field draws the next value
/// from this counter. "Has anything changed since serial N" is then an
/// O(1) comparison instead of a model-wide diff, which is what the
/// control-volume persistence and incremental listing rely on.

use serde::{Deserialize, Serialize};

/// Monotonic change-serial generator, owned by the process-wide model
/// context and threaded explicitly through every mutator call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialGen {
    current: u64,
}

impl SerialGen {
    pub fn new(start: u64) -> Self {
        Self { current: start }
    }

    /// The serial of the most recent change.
    pub fn peek(&self) -> u64 {
        self.current
    }

    /// Draw the next serial.
    pub fn next_serial(&mut self) -> u64 {
        self.current += 1;
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_monotonic() {
        let mut gen = SerialGen::new(5);
        assert_eq!(gen.peek(), 5);
        assert_eq!(gen.next_serial(), 6);
        assert_eq!(gen.next_serial(), 7);
        assert_eq!(gen.peek(), 7);
    }
}
