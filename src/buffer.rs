/// Zero-length chunk that ends a chunked body.
pub const CHUNK_CLOSE: &[u8] = b"0\r\n\r\n";

/// Anything bytes can be written into without waiting.
pub trait ByteSink {
    fn write_bytes(&mut self, data: &[u8]);
}

impl ByteSink for Vec<u8> {
    fn write_bytes(&mut self, data: &[u8]) {
        self.extend_from_slice(data);
    }
}

/// Frames `data` as one chunk of a chunked body.
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    let mut chunk = format!("{:x}\r\n", data.len()).into_bytes();
    chunk.reserve(data.len() + 2);
    chunk.extend_from_slice(data);
    chunk.extend_from_slice(b"\r\n");
    chunk
}

/// Writes a body fragment, chunk-framed when `chunked` is set. Empty
/// fragments are dropped in chunked mode since a zero-length chunk would end
/// the body.
pub fn write_body<S: ByteSink + ?Sized>(sink: &mut S, data: &[u8], chunked: bool) {
    if !chunked {
        sink.write_bytes(data);
    } else if !data.is_empty() {
        sink.write_bytes(&encode_chunk(data));
    }
}

/// In-memory sink a filter writes into when it replaces a body chunk.
#[derive(Debug, Default, Clone)]
pub struct Accumulator {
    data: Vec<u8>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    pub fn reset(&mut self) {
        self.data.clear();
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

impl ByteSink for Accumulator {
    fn write_bytes(&mut self, data: &[u8]) {
        self.write(data);
    }
}

/// Holds back writes to the client until more than `peek_size` bytes have
/// accumulated (or until `flush`), then turns into a pass-through for good.
#[derive(Debug)]
pub struct PeekBuffer {
    peek_size: usize,
    peeking: bool,
    data: Vec<u8>,
}

impl PeekBuffer {
    pub fn new(peek_size: usize) -> Self {
        Self {
            peek_size,
            peeking: peek_size > 0,
            data: Vec::new(),
        }
    }

    pub fn is_peeking(&self) -> bool {
        self.peeking
    }

    pub fn buffered(&self) -> usize {
        self.data.len()
    }

    pub fn write<S: ByteSink + ?Sized>(&mut self, chunk: &[u8], sink: &mut S) {
        if !self.peeking {
            sink.write_bytes(chunk);
            return;
        }
        self.data.extend_from_slice(chunk);
        if self.data.len() > self.peek_size {
            self.flush(sink);
        }
    }

    pub fn write_body<S: ByteSink + ?Sized>(&mut self, data: &[u8], chunked: bool, sink: &mut S) {
        if !chunked {
            self.write(data, sink);
        } else if !data.is_empty() {
            self.write(&encode_chunk(data), sink);
        }
    }

    /// Forwards everything held so far and stops peeking. No-op once
    /// flushed.
    pub fn flush<S: ByteSink + ?Sized>(&mut self, sink: &mut S) {
        if !self.peeking {
            return;
        }
        self.peeking = false;
        if !self.data.is_empty() {
            sink.write_bytes(&self.data);
        }
        self.data = Vec::new();
    }

    /// Drops held bytes; nothing of them ever reaches the sink.
    pub fn discard(&mut self) {
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Writes(Vec<Vec<u8>>);

    impl ByteSink for Writes {
        fn write_bytes(&mut self, data: &[u8]) {
            self.0.push(data.to_vec());
        }
    }

    #[test]
    fn peek_holds_until_size_exceeded() {
        let mut sink = Writes::default();
        let mut peek = PeekBuffer::new(10);

        peek.write(b"abcd", &mut sink);
        peek.write(b"efgh", &mut sink);
        assert!(sink.0.is_empty());
        assert!(peek.is_peeking());

        peek.write(b"ijkl", &mut sink);
        assert_eq!(sink.0, vec![b"abcdefghijkl".to_vec()]);
        assert!(!peek.is_peeking());

        peek.write(b"m", &mut sink);
        assert_eq!(sink.0.len(), 2);
        assert_eq!(sink.0[1], b"m");
    }

    #[test]
    fn peek_exactly_at_size_keeps_holding() {
        let mut sink = Writes::default();
        let mut peek = PeekBuffer::new(4);
        peek.write(b"abcd", &mut sink);
        assert!(sink.0.is_empty());
        assert_eq!(peek.buffered(), 4);
    }

    #[test]
    fn zero_peek_size_passes_through() {
        let mut sink = Vec::new();
        let mut peek = PeekBuffer::new(0);
        assert!(!peek.is_peeking());
        peek.write(b"abc", &mut sink);
        assert_eq!(sink, b"abc");
    }

    #[test]
    fn early_flush_is_one_time() {
        let mut sink = Writes::default();
        let mut peek = PeekBuffer::new(100);
        peek.write(b"head", &mut sink);
        peek.flush(&mut sink);
        peek.flush(&mut sink);
        peek.write(b"tail", &mut sink);
        assert_eq!(sink.0, vec![b"head".to_vec(), b"tail".to_vec()]);
    }

    #[test]
    fn discarded_bytes_never_reach_the_sink() {
        let mut sink = Vec::new();
        let mut peek = PeekBuffer::new(100);
        peek.write(b"secret", &mut sink);
        peek.discard();
        peek.flush(&mut sink);
        assert!(sink.is_empty());
    }

    #[test]
    fn chunk_framing() {
        assert_eq!(encode_chunk(&[0u8; 26])[..4], *b"1a\r\n");

        let mut sink = Vec::new();
        write_body(&mut sink, b"hello", true);
        write_body(&mut sink, b"", true);
        sink.extend_from_slice(CHUNK_CLOSE);
        assert_eq!(sink, b"5\r\nhello\r\n0\r\n\r\n");

        let mut raw = Vec::new();
        write_body(&mut raw, b"hello", false);
        assert_eq!(raw, b"hello");
    }

    #[test]
    fn accumulator_take_resets() {
        let mut acc = Accumulator::new();
        acc.write(b"ab");
        acc.write_bytes(b"c");
        assert_eq!(acc.size(), 3);
        assert_eq!(acc.take(), b"abc");
        assert!(acc.is_empty());
    }
}
