//! Fixed-capacity byte pipe between the UART receive path and the AT parser.
//! All-or-nothing `add`: a write that would overrun the unread data is
//! rejected wholesale rather than partially applied.

use core::cell::RefCell;
use critical_section::Mutex;

struct Inner<const N: usize> {
    buf: [u8; N],
    read_idx: usize,
    write_idx: usize,
    len: usize,
}

impl<const N: usize> Inner<N> {
    const fn new() -> Self {
        Self {
            buf: [0; N],
            read_idx: 0,
            write_idx: 0,
            len: 0,
        }
    }

    fn add(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > N - self.len {
            return false;
        }
        for &b in bytes {
            self.buf[self.write_idx] = b;
            self.write_idx = (self.write_idx + 1) % N;
        }
        self.len += bytes.len();
        true
    }

    fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        for slot in out.iter_mut().take(n) {
            *slot = self.buf[self.read_idx];
            self.read_idx = (self.read_idx + 1) % N;
        }
        self.len -= n;
        n
    }

    fn reset(&mut self) {
        self.read_idx = 0;
        self.write_idx = 0;
        self.len = 0;
    }
}

/// A mutex-guarded ring buffer of fixed capacity `N`.
pub struct RingBuffer<const N: usize> {
    inner: Mutex<RefCell<Inner<N>>>,
}

impl<const N: usize> RingBuffer<N> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner::new())),
        }
    }

    /// Stores every byte of `bytes`, or none of them if there isn't room.
    /// Returns whether the write was accepted.
    pub fn add(&self, bytes: &[u8]) -> bool {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).add(bytes))
    }

    /// Consumes up to `out.len()` bytes into `out`, returning the count read.
    pub fn read(&self, out: &mut [u8]) -> usize {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).read(out))
    }

    pub fn data_size(&self) -> usize {
        critical_section::with(|cs| self.inner.borrow_ref(cs).len)
    }

    pub fn available_size(&self) -> usize {
        N - self.data_size()
    }

    pub fn reset(&self) {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).reset());
    }
}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_read_round_trips() {
        let rb: RingBuffer<8> = RingBuffer::new();
        assert!(rb.add(b"abcd"));
        assert_eq!(rb.data_size(), 4);
        let mut out = [0u8; 4];
        assert_eq!(rb.read(&mut out), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(rb.data_size(), 0);
    }

    #[test]
    fn add_rejects_when_too_large_leaves_buffer_unchanged() {
        let rb: RingBuffer<4> = RingBuffer::new();
        assert!(rb.add(b"ab"));
        assert!(!rb.add(b"abc"));
        assert_eq!(rb.data_size(), 2);
    }

    #[test]
    fn wraps_around_without_corruption() {
        let rb: RingBuffer<4> = RingBuffer::new();
        assert!(rb.add(b"ab"));
        let mut out = [0u8; 2];
        assert_eq!(rb.read(&mut out), 2);
        assert!(rb.add(b"cdef"));
        let mut out2 = [0u8; 4];
        assert_eq!(rb.read(&mut out2), 4);
        assert_eq!(&out2, b"cdef");
    }

    #[test]
    fn reset_drops_all_data() {
        let rb: RingBuffer<4> = RingBuffer::new();
        assert!(rb.add(b"ab"));
        rb.reset();
        assert_eq!(rb.data_size(), 0);
        assert_eq!(rb.available_size(), 4);
    }

    #[test]
    fn leak_free_add_remove_never_exceeds_capacity() {
        let rb: RingBuffer<16> = RingBuffer::new();
        for round in 0..100u8 {
            let n = (round % 5) as usize + 1;
            let data: heapless::Vec<u8, 16> = (0..n).map(|i| i as u8).collect();
            let _ = rb.add(&data);
            let mut out = [0u8; 16];
            let read = rb.read(&mut out[..n.min(16)]);
            assert!(read <= n);
            assert!(rb.data_size() <= 16);
        }
    }
}
