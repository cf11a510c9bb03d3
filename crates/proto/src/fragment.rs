//! Splitting outbound messages into bounded DATA fragments and stitching
//! inbound fragment streams back together.

/// Split `message` into chunks of at most `max_fragment_size` bytes.
///
/// A zero-length message still produces exactly one (empty) fragment, so
/// the receiver always sees a `last_fragment` packet.
pub fn fragment_message(message: &[u8], max_fragment_size: usize) -> Vec<Vec<u8>> {
    if message.is_empty() {
        return vec![Vec::new()];
    }
    message
        .chunks(max_fragment_size)
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Receiver-side fragment buffer for one sender.
///
/// Payloads are appended in arrival order and flushed into a single message
/// when the `last_fragment` packet is accepted.
#[derive(Debug, Default)]
pub struct Reassembly {
    fragments: Vec<Vec<u8>>,
}

impl Reassembly {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, payload: Vec<u8>) {
        self.fragments.push(payload);
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    /// Concatenate everything buffered so far and clear the buffer.
    pub fn flush(&mut self) -> Vec<u8> {
        let message = self.fragments.concat();
        self.fragments.clear();
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_splits_into_hel_lo() {
        let fragments = fragment_message(b"HELLO", 3);
        assert_eq!(fragments, vec![b"HEL".to_vec(), b"LO".to_vec()]);
    }

    #[test]
    fn empty_message_yields_one_empty_fragment() {
        let fragments = fragment_message(b"", 3);
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].is_empty());
    }

    #[test]
    fn chunk_count_is_ceil_of_length_over_size() {
        for len in 0..=12usize {
            let message = vec![b'x'; len];
            let fragments = fragment_message(&message, 4);
            let expected = if len == 0 { 1 } else { len.div_ceil(4) };
            assert_eq!(fragments.len(), expected, "length {len}");
        }
    }

    #[test]
    fn reassembly_reproduces_original_for_various_lengths() {
        let max = 3;
        for len in 0..=(max * 4) {
            let message: Vec<u8> = (0..len as u8).collect();
            let mut buffer = Reassembly::new();
            for fragment in fragment_message(&message, max) {
                buffer.push(fragment);
            }
            assert_eq!(buffer.flush(), message, "length {len}");
        }
    }

    #[test]
    fn flush_clears_the_buffer() {
        let mut buffer = Reassembly::new();
        buffer.push(b"ab".to_vec());
        buffer.push(b"cd".to_vec());
        assert_eq!(buffer.flush(), b"abcd");
        assert_eq!(buffer.fragment_count(), 0);
        assert!(buffer.flush().is_empty());
    }
}
