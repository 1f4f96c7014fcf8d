use std::collections::VecDeque;

/// Fixed-capacity FIFO that evicts its oldest element once full.
///
/// Storage is allocated once at construction and never grows, so both
/// `push` and eviction are O(1) regardless of how long the session runs.
#[derive(Clone, Debug)]
pub struct HistoryBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> HistoryBuffer<T> {
    /// Creates an empty buffer. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends `value`, returning the evicted element if the buffer was full.
    pub fn push(&mut self, value: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(value);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    /// Iterates oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl<T: Clone> HistoryBuffer<T> {
    /// Copies the contents out, oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn evicts_oldest_when_full() {
        let mut buf = HistoryBuffer::new(2);
        assert_eq!(buf.push(1), None);
        assert_eq!(buf.push(2), None);
        assert_eq!(buf.push(3), Some(1));
        assert_eq!(buf.to_vec(), vec![2, 3]);
        assert_eq!(buf.latest(), Some(&3));
    }

    #[test]
    fn zero_capacity_holds_one() {
        let mut buf = HistoryBuffer::new(0);
        buf.push("a");
        buf.push("b");
        assert_eq!(buf.capacity(), 1);
        assert_eq!(buf.to_vec(), vec!["b"]);
    }

    #[test]
    fn storage_is_not_reallocated() {
        let mut buf = HistoryBuffer::new(8);
        let reserved = buf.items.capacity();
        for i in 0..1_000 {
            buf.push(i);
        }
        assert_eq!(buf.items.capacity(), reserved);
    }

    proptest! {
        #[test]
        fn keeps_last_capacity_values_in_order(
            capacity in 1usize..64,
            values in proptest::collection::vec(any::<i32>(), 0..256),
        ) {
            let mut buf = HistoryBuffer::new(capacity);
            for (i, v) in values.iter().enumerate() {
                buf.push(*v);
                prop_assert!(buf.len() <= capacity);
                prop_assert_eq!(buf.len(), (i + 1).min(capacity));
            }

            let start = values.len().saturating_sub(capacity);
            prop_assert_eq!(buf.to_vec(), values[start..].to_vec());
        }
    }
}
