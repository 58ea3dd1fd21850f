use std::collections::VecDeque;

/// Fixed-capacity FIFO that drops its oldest item on overflow.
#[derive(Debug, Clone)]
pub struct BoundedBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Appends `item`, returning the evicted oldest item if the buffer was full.
    ///
    /// With zero capacity the item itself is returned.
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(item);
        }
        let dropped = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        dropped
    }

    /// Removes and returns every item, oldest first.
    pub fn drain(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }

    /// Puts items back at the front, ahead of anything buffered since.
    pub fn restore(&mut self, items: Vec<T>) {
        for item in items.into_iter().rev() {
            self.items.push_front(item);
        }
        while self.items.len() > self.capacity {
            self.items.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_drops_oldest() {
        let mut buffer = BoundedBuffer::new(2);
        assert_eq!(buffer.push(1), None);
        assert_eq!(buffer.push(2), None);
        assert_eq!(buffer.push(3), Some(1));
        assert_eq!(buffer.drain(), vec![2, 3]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let mut buffer = BoundedBuffer::new(0);
        assert_eq!(buffer.push("a"), Some("a"));
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn test_restore_keeps_order_and_capacity() {
        let mut buffer = BoundedBuffer::new(3);
        buffer.push(3);
        buffer.restore(vec![1, 2]);
        assert_eq!(buffer.drain(), vec![1, 2, 3]);

        buffer.push(4);
        buffer.push(5);
        buffer.restore(vec![1, 2, 3]);
        assert_eq!(buffer.drain(), vec![3, 4, 5]);
    }
}
