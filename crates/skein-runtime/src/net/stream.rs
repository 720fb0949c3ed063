use crate::net::Socket;
use crate::op::Op;
use skein_types::Error;

const DEFAULT_DELIMITER: &[u8] = b"\r\n";
const DEFAULT_LINE_LIMIT: usize = 16 * 1024;
const DEFAULT_CHUNK: usize = 4096;

/// One step of a delimited read.
pub enum LineStep {
    /// A complete line, delimiter included. Overrun bytes stay in the
    /// socket's pushback buffer.
    Line(Vec<u8>),
    /// Not enough buffered data: yield this operation, [`feed`] the
    /// bytes it returns, and ask again.
    ///
    /// [`feed`]: BufferedStream::feed
    More(Op),
}

/// One step of a sized read. Same driving contract as [`LineStep`].
pub enum ReadStep {
    Data(Vec<u8>),
    More(Op),
}

/// Line/byte reader over a socket.
///
/// The adapter is purely a parser: it never performs I/O itself. When it
/// needs more data it hands back the `Recv` operation to yield, and the
/// received bytes are fed into the socket's pushback buffer. Because the
/// buffer lives on the socket, a direct `Recv` issued elsewhere drains
/// it first — bytes are delivered exactly once, in order.
///
/// ```text
/// loop {
///     match stream.read_line()? {
///         LineStep::Line(line) => break line,
///         LineStep::More(op) => { let bytes = /* yield op */; stream.feed(&bytes); }
///     }
/// }
/// ```
pub struct BufferedStream {
    sock: Socket,
    delimiter: Vec<u8>,
    limit: usize,
    chunk: usize,
}

impl BufferedStream {
    pub fn new(sock: &Socket) -> Self {
        BufferedStream {
            sock: sock.clone(),
            delimiter: DEFAULT_DELIMITER.to_vec(),
            limit: DEFAULT_LINE_LIMIT,
            chunk: DEFAULT_CHUNK,
        }
    }

    /// Use a different line delimiter (default `\r\n`).
    pub fn with_delimiter(mut self, delimiter: impl Into<Vec<u8>>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    /// Cap on how many bytes a line may span before the read fails with
    /// a protocol error (default 16 KiB).
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Receive size used when more data is needed (default 4096).
    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk;
        self
    }

    /// The socket this stream reads from.
    pub fn socket(&self) -> &Socket {
        &self.sock
    }

    /// Ingest bytes returned by a `More` operation.
    pub fn feed(&self, bytes: &[u8]) {
        self.sock.with_pushback(|buf| buf.extend_from_slice(bytes));
    }

    /// Try to produce the next delimited line from buffered data.
    ///
    /// Fails with [`Error::Protocol`] once the buffer exceeds the line
    /// limit without a delimiter in sight.
    pub fn read_line(&self) -> Result<LineStep, Error> {
        let found = self.sock.with_pushback(|buf| find(buf, &self.delimiter));
        if let Some(at) = found {
            let end = at + self.delimiter.len();
            let line = self.sock.take_pushback(end);
            return Ok(LineStep::Line(line));
        }
        let buffered = self.sock.with_pushback(|buf| buf.len());
        if buffered > self.limit {
            return Err(Error::Protocol(format!(
                "line exceeds {} bytes without a delimiter",
                self.limit
            )));
        }
        Ok(LineStep::More(self.more(self.chunk)))
    }

    /// Take up to `n` bytes.
    pub fn read(&self, n: usize) -> ReadStep {
        if n == 0 {
            return ReadStep::Data(Vec::new());
        }
        if self.sock.pushback_is_empty() {
            ReadStep::More(self.more(n.min(self.chunk)))
        } else {
            ReadStep::Data(self.sock.take_pushback(n))
        }
    }

    /// A `Recv` that bypasses the pushback buffer: this stream already
    /// examined those bytes, re-draining them would spin forever.
    fn more(&self, len: usize) -> Op {
        let mut op = self.sock.recv(len);
        if let crate::op::OpKind::Recv { drain_buffered, .. } = &mut op.kind {
            *drain_buffered = false;
        }
        op
    }
}

/// First occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    fn stream() -> BufferedStream {
        BufferedStream::new(&Socket::stream_v4().expect("socket"))
    }

    fn expect_line(step: LineStep) -> Vec<u8> {
        match step {
            LineStep::Line(line) => line,
            LineStep::More(_) => panic!("expected a complete line"),
        }
    }

    #[test]
    fn line_split_across_feeds_is_reassembled() {
        let s = stream();
        assert!(matches!(s.read_line(), Ok(LineStep::More(_))));
        s.feed(b"GET / HT");
        assert!(matches!(s.read_line(), Ok(LineStep::More(_))));
        s.feed(b"TP/1.1\r\nHost:");
        assert_eq!(expect_line(s.read_line().unwrap()), b"GET / HTTP/1.1\r\n".to_vec());
    }

    #[test]
    fn overrun_bytes_stay_for_the_next_read() {
        let s = stream();
        s.feed(b"one\r\ntwo\r\nthr");
        assert_eq!(expect_line(s.read_line().unwrap()), b"one\r\n".to_vec());
        assert_eq!(expect_line(s.read_line().unwrap()), b"two\r\n".to_vec());
        // The partial third line is retained, not lost.
        assert!(matches!(s.read_line(), Ok(LineStep::More(_))));
        match s.read(16) {
            ReadStep::Data(d) => assert_eq!(d, b"thr".to_vec()),
            ReadStep::More(_) => panic!("buffered bytes must drain first"),
        }
    }

    #[test]
    fn a_direct_recv_would_drain_the_buffer_first() {
        let s = stream();
        s.feed(b"leftover");
        // The flag that makes stream reads bypass the buffer is not set
        // on user-built operations.
        match s.socket().recv(64).kind {
            crate::op::OpKind::Recv { drain_buffered, .. } => assert!(drain_buffered),
            _ => unreachable!(),
        }
        match s.read_line().unwrap() {
            LineStep::More(op) => match op.kind {
                crate::op::OpKind::Recv { drain_buffered, .. } => assert!(!drain_buffered),
                _ => unreachable!(),
            },
            LineStep::Line(_) => panic!("no delimiter yet"),
        }
    }

    #[test]
    fn oversized_line_is_a_protocol_error() {
        let s = stream().with_limit(8);
        s.feed(b"0123456789abcdef");
        match s.read_line() {
            Err(Error::Protocol(_)) => {}
            _ => panic!("expected a protocol error"),
        }
    }

    #[test]
    fn custom_delimiter() {
        let s = stream().with_delimiter(b"\n".to_vec());
        s.feed(b"a\nb\n");
        assert_eq!(expect_line(s.read_line().unwrap()), b"a\n".to_vec());
        assert_eq!(expect_line(s.read_line().unwrap()), b"b\n".to_vec());
    }

    #[test]
    fn sized_read_requests_more_only_when_empty() {
        let s = stream();
        assert!(matches!(s.read(4), ReadStep::More(_)));
        s.feed(b"abcdef");
        match s.read(4) {
            ReadStep::Data(d) => assert_eq!(d, b"abcd".to_vec()),
            ReadStep::More(_) => panic!("buffer was non-empty"),
        }
    }
}
