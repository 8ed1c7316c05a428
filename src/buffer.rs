//! A power-of-two-sized resizable buffer, used for the poller's
//! kernel-event scratch space.
//!
//! Grounded on the original design's `Buffer<T>`: capacity only ever grows,
//! always to the next power of two, so repeated growth during a burst of
//! readiness doesn't thrash the allocator.

pub struct Buffer<T> {
    data: Vec<T>,
}

impl<T: Default + Clone> Buffer<T> {
    pub fn new() -> Self {
        Buffer { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut buf = Self::new();
        buf.set_length(capacity);
        buf
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Grows (never shrinks) the buffer to at least `length`, rounding the
    /// new capacity up to the next power of two.
    pub fn set_length(&mut self, length: usize) {
        if length <= self.data.len() {
            return;
        }
        let new_len = length.next_power_of_two();
        self.data.resize(new_len, T::default());
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T: Default + Clone> Default for Buffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_to_next_power_of_two() {
        let mut buf: Buffer<u8> = Buffer::new();
        buf.set_length(5);
        assert_eq!(buf.len(), 8);
        buf.set_length(8);
        assert_eq!(buf.len(), 8);
        buf.set_length(9);
        assert_eq!(buf.len(), 16);
    }
}
