//! Rolling checksum module
//!
//! Windowed Adler-32 with O(1) roll, for locating block boundaries in a
//! shifted local copy. The value always equals the plain Adler-32 of the
//! last `min(bytes_seen, window)` bytes.

const MOD_ADLER: u64 = 65521;

/// A rolling Adler-32 over a fixed-size window
#[derive(Debug, Clone)]
pub struct RollingAdler32 {
    window: Vec<u8>,
    head: usize,
    count: usize,
    a: u64,
    b: u64,
}

impl RollingAdler32 {
    /// Create a rolling checksum with the given window size
    pub fn new(window_size: usize) -> Self {
        assert!(window_size > 0, "window size must be positive");
        Self {
            window: vec![0; window_size],
            head: 0,
            count: 0,
            a: 1,
            b: 0,
        }
    }

    /// Size of the rolling window
    pub fn window_size(&self) -> usize {
        self.window.len()
    }

    /// Number of bytes currently contributing to the value
    pub fn filled(&self) -> usize {
        self.count
    }

    /// True once the window holds `window_size` bytes
    pub fn is_full(&self) -> bool {
        self.count == self.window.len()
    }

    /// Push one byte, rolling the oldest byte out once the window is full
    pub fn update(&mut self, byte: u8) {
        let n = self.window.len();
        if self.count < n {
            self.a = (self.a + byte as u64) % MOD_ADLER;
            self.b = (self.b + self.a) % MOD_ADLER;
            self.window[(self.head + self.count) % n] = byte;
            self.count += 1;
        } else {
            let old = self.window[self.head] as u64;
            // a' = a - old + new; b' = b - n*old + a' - 1  (mod 65521)
            self.a = (self.a + MOD_ADLER + byte as u64 - old) % MOD_ADLER;
            self.b = (self.b + MOD_ADLER * (n as u64 + 1) + self.a
                - (n as u64 * old) % MOD_ADLER
                - 1)
                % MOD_ADLER;
            self.window[self.head] = byte;
            self.head = (self.head + 1) % n;
        }
    }

    /// Push a slice of bytes
    pub fn update_slice(&mut self, data: &[u8]) {
        for &byte in data {
            self.update(byte);
        }
    }

    /// Current checksum value
    pub fn value(&self) -> u32 {
        ((self.b << 16) | self.a) as u32
    }

    /// Copy the current window contents in order, oldest byte first
    pub fn window_bytes(&self) -> Vec<u8> {
        let n = self.window.len();
        let mut out = Vec::with_capacity(self.count);
        for i in 0..self.count {
            out.push(self.window[(self.head + i) % n]);
        }
        out
    }

    /// Reset to the empty state
    pub fn reset(&mut self) {
        self.head = 0;
        self.count = 0;
        self.a = 1;
        self.b = 0;
    }
}

/// Plain Adler-32 of a byte slice
pub fn adler32(data: &[u8]) -> u32 {
    let mut a: u64 = 1;
    let mut b: u64 = 0;
    for &byte in data {
        a = (a + byte as u64) % MOD_ADLER;
        b = (b + a) % MOD_ADLER;
    }
    ((b << 16) | a) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_known_vector() {
        // Adler-32("Wikipedia") = 0x11E60398
        let mut ch = RollingAdler32::new(10);
        ch.update_slice(b"Wikipedia");
        assert_eq!(ch.value(), 0x11E6_0398);
        assert_eq!(adler32(b"Wikipedia"), 0x11E6_0398);
    }

    #[test]
    fn test_empty_value() {
        let ch = RollingAdler32::new(8);
        assert_eq!(ch.value(), 1);
        assert_eq!(adler32(&[]), 1);
    }

    #[test]
    fn test_rolling_equals_tail_checksum() {
        const WINDOW: usize = 10;
        let mut rng = rand::thread_rng();
        let data: Vec<u8> = (0..2048).map(|_| rng.gen()).collect();

        let mut ch = RollingAdler32::new(WINDOW);
        ch.update_slice(&data);
        assert_eq!(ch.value(), adler32(&data[data.len() - WINDOW..]));
    }

    #[test]
    fn test_rolling_matches_at_every_position() {
        const WINDOW: usize = 16;
        let mut rng = rand::thread_rng();
        let data: Vec<u8> = (0..256).map(|_| rng.gen()).collect();

        let mut ch = RollingAdler32::new(WINDOW);
        for (i, &byte) in data.iter().enumerate() {
            ch.update(byte);
            if i + 1 >= WINDOW {
                let start = i + 1 - WINDOW;
                assert_eq!(
                    ch.value(),
                    adler32(&data[start..=i]),
                    "mismatch at position {}",
                    i
                );
            }
        }
    }

    #[test]
    fn test_window_bytes_order() {
        let mut ch = RollingAdler32::new(4);
        ch.update_slice(b"abcdef");
        assert_eq!(ch.window_bytes(), b"cdef");
        assert!(ch.is_full());
    }

    #[test]
    fn test_reset() {
        let mut ch = RollingAdler32::new(4);
        ch.update_slice(b"abcd");
        ch.reset();
        assert_eq!(ch.value(), 1);
        assert_eq!(ch.filled(), 0);
        ch.update_slice(b"abcd");
        assert_eq!(ch.value(), adler32(b"abcd"));
    }

    #[test]
    fn test_partial_window() {
        let mut ch = RollingAdler32::new(100);
        ch.update_slice(b"abc");
        assert!(!ch.is_full());
        assert_eq!(ch.value(), adler32(b"abc"));
        assert_eq!(ch.window_bytes(), b"abc");
    }
}
