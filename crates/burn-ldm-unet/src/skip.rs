//! Skip-connection stack
//!
//! The encoder pushes one entry per skip connection and the decoder pops them
//! in reverse order. The stack is an ordinary value: the down pass returns it
//! and the up pass consumes it, so no state outlives a forward call.
//!
//! The same type carries channel counts (`SkipStack<usize>`) while the network
//! is assembled, which checks the push/pop discipline before any tensor exists.

/// Last-in-first-out stack of skip activations
#[derive(Debug, Clone)]
pub struct SkipStack<T> {
    entries: Vec<T>,
    pushes: usize,
    pops: usize,
}

impl<T> SkipStack<T> {
    /// Creates an empty stack
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates an empty stack with room for `capacity` entries
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            pushes: 0,
            pops: 0,
        }
    }

    /// Pushes an entry
    pub fn push(&mut self, entry: T) {
        self.pushes += 1;
        self.entries.push(entry);
    }

    /// Pops the most recent entry
    ///
    /// # Panics
    ///
    /// Panics if the stack is empty: the decoder asked for more skips than the
    /// encoder produced, which is a topology bug.
    pub fn pop(&mut self) -> T {
        match self.entries.pop() {
            Some(entry) => {
                self.pops += 1;
                entry
            }
            None => panic!(
                "skip stack underflow: pop #{} after {} pushes",
                self.pops + 1,
                self.pushes
            ),
        }
    }

    /// Entries currently on the stack
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the stack is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total pushes so far
    pub fn pushes(&self) -> usize {
        self.pushes
    }

    /// Total pops so far
    pub fn pops(&self) -> usize {
        self.pops
    }

    /// Ends the traversal
    ///
    /// # Panics
    ///
    /// Panics if entries remain: the encoder produced skips the decoder never
    /// consumed.
    pub fn finish(self) {
        assert!(
            self.entries.is_empty(),
            "skip stack imbalance: {} entries left after {} pushes and {} pops",
            self.entries.len(),
            self.pushes,
            self.pops
        );
    }
}

impl<T> Default for SkipStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifo_order_and_counters() {
        let mut stack = SkipStack::new();
        stack.push(1);
        stack.push(2);
        stack.push(3);

        assert_eq!(stack.pop(), 3);
        assert_eq!(stack.pop(), 2);
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.pushes(), 3);
        assert_eq!(stack.pops(), 2);

        assert_eq!(stack.pop(), 1);
        assert!(stack.is_empty());
        stack.finish();
    }

    #[test]
    #[should_panic(expected = "skip stack underflow")]
    fn test_pop_from_empty_panics() {
        let mut stack: SkipStack<usize> = SkipStack::new();
        stack.push(320);
        stack.pop();
        stack.pop();
    }

    #[test]
    #[should_panic(expected = "skip stack imbalance")]
    fn test_finish_with_leftovers_panics() {
        let mut stack = SkipStack::with_capacity(2);
        stack.push(320);
        stack.push(640);
        stack.pop();
        stack.finish();
    }
}
