//! Message buffers: the units of a request or response chain, response
//! compaction, and the non-blocking write step shared by every connection.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, IoSlice, Write};
use std::os::unix::io::AsRawFd;

use crate::buffer_pool::{PooledBytes, SharedBufferPool};
use crate::constants::MAX_WRITE_SLICES;
use crate::metrics;

/// Invoked exactly once when a file region has been written, failed, or was
/// released before it could be written.
pub type FileCompletion = Box<dyn FnOnce(io::Result<()>) + Send>;

/// A byte range of a file, sent to the socket without copying through user
/// space.
pub struct FileRegion {
    file: File,
    offset: u64,
    remaining: u64,
    on_complete: Option<FileCompletion>,
}

impl FileRegion {
    pub fn new(file: File, offset: u64, count: u64) -> Self {
        Self {
            file,
            offset,
            remaining: count,
            on_complete: None,
        }
    }

    pub fn on_complete(mut self, callback: impl FnOnce(io::Result<()>) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    fn advance(&mut self, n: u64) {
        self.offset += n;
        self.remaining -= n;
    }

    fn complete(&mut self, result: io::Result<()>) {
        if let Some(callback) = self.on_complete.take() {
            callback(result);
        }
    }
}

impl Drop for FileRegion {
    fn drop(&mut self) {
        self.complete(Err(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "file region released before being written",
        )));
    }
}

impl std::fmt::Debug for FileRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRegion")
            .field("offset", &self.offset)
            .field("remaining", &self.remaining)
            .finish()
    }
}

/// One node of a message.
#[derive(Debug)]
pub enum StreamBuffer {
    /// Pool (or packing) storage; unconsumed bytes are the payload.
    Pooled(PooledBytes),
    /// Caller-owned bytes with a consume cursor.
    Unpooled { data: Cow<'static, [u8]>, pos: usize },
    File(FileRegion),
}

impl StreamBuffer {
    pub fn unpooled(data: impl Into<Cow<'static, [u8]>>) -> Self {
        StreamBuffer::Unpooled {
            data: data.into(),
            pos: 0,
        }
    }

    pub fn file(region: FileRegion) -> Self {
        StreamBuffer::File(region)
    }

    /// In-memory bytes still to be consumed; empty for file regions.
    pub fn bytes(&self) -> &[u8] {
        match self {
            StreamBuffer::Pooled(buffer) => buffer.unconsumed(),
            StreamBuffer::Unpooled { data, pos } => &data[*pos..],
            StreamBuffer::File(_) => &[],
        }
    }

    /// Bytes still to be consumed, including file regions.
    pub fn remaining(&self) -> u64 {
        match self {
            StreamBuffer::File(region) => region.remaining(),
            _ => self.bytes().len() as u64,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, StreamBuffer::File(_))
    }

    fn consume(&mut self, n: usize) {
        match self {
            StreamBuffer::Pooled(buffer) => buffer.consume(n),
            StreamBuffer::Unpooled { data, pos } => {
                assert!(*pos + n <= data.len(), "consume past unpooled bytes");
                *pos += n;
            }
            StreamBuffer::File(region) => region.advance(n as u64),
        }
    }
}

impl From<PooledBytes> for StreamBuffer {
    fn from(buffer: PooledBytes) -> Self {
        StreamBuffer::Pooled(buffer)
    }
}

/// Ordered buffers forming one logical message.
#[derive(Debug, Default)]
pub struct BufferChain {
    buffers: VecDeque<StreamBuffer>,
}

impl BufferChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `data` into as many pooled buffers as needed.
    pub fn copy_from(pool: &SharedBufferPool, mut data: &[u8]) -> Self {
        let mut chain = Self::new();
        while !data.is_empty() {
            let mut buffer = PooledBytes::acquire_or_detached(pool);
            let n = buffer.extend_from_slice(data);
            data = &data[n..];
            chain.push(StreamBuffer::Pooled(buffer));
        }
        chain
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        let mut chain = Self::new();
        chain.push(StreamBuffer::unpooled(data));
        chain
    }

    pub fn push(&mut self, buffer: impl Into<StreamBuffer>) {
        self.buffers.push_back(buffer.into());
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Total bytes across the chain, including file regions.
    pub fn total_bytes(&self) -> u64 {
        self.buffers.iter().map(StreamBuffer::remaining).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamBuffer> {
        self.buffers.iter()
    }

    /// Concatenate in-memory bytes (file regions are skipped).
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bytes() as usize);
        for buffer in &self.buffers {
            out.extend_from_slice(buffer.bytes());
        }
        out
    }

    /// Release every buffer back to its pool.
    pub fn release(self) {}
}

impl IntoIterator for BufferChain {
    type Item = StreamBuffer;
    type IntoIter = std::collections::vec_deque::IntoIter<StreamBuffer>;

    fn into_iter(self) -> Self::IntoIter {
        self.buffers.into_iter()
    }
}

/// Response bytes packed into as few pool buffers as possible.
///
/// In-memory buffers are copied into the tail packing buffer, spilling into a
/// fresh pool buffer only when the tail is full. File regions are appended
/// as-is and close the current packing buffer.
pub struct OutboundChain {
    pool: SharedBufferPool,
    buffers: VecDeque<StreamBuffer>,
}

impl OutboundChain {
    pub fn new(pool: SharedBufferPool) -> Self {
        Self {
            pool,
            buffers: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Copy bytes onto the end of the chain.
    pub fn write_bytes(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            if let Some(StreamBuffer::Pooled(tail)) = self.buffers.back_mut() {
                let n = tail.extend_from_slice(data);
                data = &data[n..];
                if data.is_empty() {
                    return;
                }
            }
            self.buffers
                .push_back(StreamBuffer::Pooled(PooledBytes::acquire_or_detached(
                    &self.pool,
                )));
        }
    }

    /// Append a buffer, consuming (and releasing) it unless it is a file region.
    pub fn append(&mut self, buffer: StreamBuffer) {
        match buffer {
            StreamBuffer::File(region) => self.buffers.push_back(StreamBuffer::File(region)),
            other => self.write_bytes(other.bytes()),
        }
    }

    pub fn append_chain(&mut self, chain: BufferChain) {
        for buffer in chain {
            self.append(buffer);
        }
    }

    pub fn take(&mut self) -> VecDeque<StreamBuffer> {
        std::mem::take(&mut self.buffers)
    }
}

impl Write for OutboundChain {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Non-blocking destination of a connection's outbound bytes.
pub trait Wire {
    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Transfer up to `count` bytes of `file` starting at `offset`.
    fn send_file(&mut self, file: &File, offset: u64, count: usize) -> io::Result<usize>;
}

impl Wire for mio::net::TcpStream {
    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        Write::write_vectored(self, bufs)
    }

    fn send_file(&mut self, file: &File, offset: u64, count: usize) -> io::Result<usize> {
        let mut off = offset as libc::off_t;
        let n = unsafe { libc::sendfile(self.as_raw_fd(), file.as_raw_fd(), &mut off, count) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

/// Outcome of a write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProgress {
    /// Queue fully written.
    Complete,
    /// The wire took less than offered; wait for writability before retrying.
    Pending,
}

/// Write queued buffers until the queue is empty or the wire stops accepting.
///
/// Fully written buffers are released (and file completions fired) as they
/// drain. A write that does not drain what it was offered returns `Pending`
/// without retrying.
pub fn drain_to_wire<W: Wire + ?Sized>(
    queue: &mut VecDeque<StreamBuffer>,
    wire: &mut W,
) -> io::Result<WriteProgress> {
    loop {
        let Some(front) = queue.front_mut() else {
            return Ok(WriteProgress::Complete);
        };

        if let StreamBuffer::File(region) = front {
            if region.remaining == 0 {
                region.complete(Ok(()));
                queue.pop_front();
                continue;
            }
            let count = region.remaining.min(usize::MAX as u64) as usize;
            match wire.send_file(&region.file, region.offset, count) {
                Ok(0) => {
                    let err = io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "file ended before region was sent",
                    );
                    region.complete(Err(io::Error::new(err.kind(), err.to_string())));
                    return Err(err);
                }
                Ok(n) => {
                    region.advance(n as u64);
                    metrics::add_bytes_written(n);
                    if region.remaining > 0 {
                        metrics::inc_partial_writes();
                        return Ok(WriteProgress::Pending);
                    }
                    region.complete(Ok(()));
                    queue.pop_front();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteProgress::Pending);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
            continue;
        }

        let (offered, result) = {
            let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(MAX_WRITE_SLICES);
            for buffer in queue.iter().take_while(|b| !b.is_file()) {
                let bytes = buffer.bytes();
                if !bytes.is_empty() {
                    slices.push(IoSlice::new(bytes));
                }
                if slices.len() == MAX_WRITE_SLICES {
                    break;
                }
            }
            let offered: usize = slices.iter().map(|s| s.len()).sum();
            if offered == 0 {
                (0, Ok(0))
            } else {
                (offered, wire.write_vectored(&slices))
            }
        };

        match result {
            Ok(0) if offered > 0 => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "connection accepted no bytes",
                ));
            }
            Ok(n) => {
                consume_written(queue, n);
                metrics::add_bytes_written(n);
                if n < offered {
                    metrics::inc_partial_writes();
                    return Ok(WriteProgress::Pending);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(WriteProgress::Pending);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

/// Advance past `n` written bytes, dropping drained in-memory buffers.
fn consume_written(queue: &mut VecDeque<StreamBuffer>, mut n: usize) {
    while let Some(front) = queue.front_mut() {
        if front.is_file() {
            break;
        }
        let available = front.bytes().len();
        if available <= n {
            n -= available;
            queue.pop_front();
        } else {
            front.consume(n);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::buffer_pool::FixedBufferPool;

    /// Accepts at most `per_call` bytes per write, then would-block after
    /// `calls_before_block` successful calls.
    struct LimitedWire {
        received: Vec<u8>,
        per_call: usize,
        calls_before_block: usize,
        calls: usize,
    }

    impl LimitedWire {
        fn new(per_call: usize, calls_before_block: usize) -> Self {
            Self {
                received: Vec::new(),
                per_call,
                calls_before_block,
                calls: 0,
            }
        }

        fn unblock(&mut self, calls: usize) {
            self.calls = 0;
            self.calls_before_block = calls;
        }
    }

    impl Wire for LimitedWire {
        fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
            if self.calls >= self.calls_before_block {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            self.calls += 1;
            let mut budget = self.per_call;
            let mut written = 0;
            for buf in bufs {
                let n = buf.len().min(budget);
                self.received.extend_from_slice(&buf[..n]);
                budget -= n;
                written += n;
                if budget == 0 {
                    break;
                }
            }
            Ok(written)
        }

        fn send_file(&mut self, file: &File, offset: u64, count: usize) -> io::Result<usize> {
            use std::os::unix::fs::FileExt;
            if self.calls >= self.calls_before_block {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            self.calls += 1;
            let mut buf = vec![0u8; count.min(self.per_call)];
            let n = file.read_at(&mut buf, offset)?;
            self.received.extend_from_slice(&buf[..n]);
            Ok(n)
        }
    }

    fn pool(size: usize) -> SharedBufferPool {
        FixedBufferPool::new(size, 64).shared()
    }

    #[test]
    fn small_writes_are_packed_into_one_buffer() {
        let pool = pool(64);
        let mut out = OutboundChain::new(Arc::clone(&pool));
        for _ in 0..10 {
            out.append(StreamBuffer::unpooled(&b"abc"[..]));
        }
        assert_eq!(out.buffer_count(), 1);
        let queue = out.take();
        assert_eq!(queue[0].bytes(), "abc".repeat(10).as_bytes());
    }

    #[test]
    fn segment_is_split_when_tail_is_full() {
        let pool = pool(8);
        let mut out = OutboundChain::new(Arc::clone(&pool));
        out.write_bytes(b"12345");
        out.write_bytes(b"6789ABCDEFG");
        let queue = out.take();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].bytes(), b"12345678");
        assert_eq!(queue[1].bytes(), b"9ABCDEFG");
    }

    #[test]
    fn appended_pool_buffers_are_released_after_copy() {
        let pool = pool(16);
        let body = BufferChain::copy_from(&pool, b"response body");
        assert_eq!(pool.stats().outstanding, 1);
        let mut out = OutboundChain::new(Arc::clone(&pool));
        out.append_chain(body);
        // the body buffer went back; one packing buffer remains
        assert_eq!(pool.stats().outstanding, 1);
        drop(out);
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn file_regions_are_not_copied() {
        let pool = pool(16);
        let file = tempfile::tempfile().expect("tempfile");
        let mut out = OutboundChain::new(Arc::clone(&pool));
        out.write_bytes(b"head");
        out.append(StreamBuffer::file(FileRegion::new(file, 0, 0)));
        out.write_bytes(b"tail");
        let queue = out.take();
        assert_eq!(queue.len(), 3);
        assert!(queue[1].is_file());
    }

    #[test]
    fn io_write_appends_to_chain() {
        let pool = pool(32);
        let mut out = OutboundChain::new(Arc::clone(&pool));
        write!(out, "HTTP/1.1 {} OK\r\n", 200).expect("write");
        let queue = out.take();
        assert_eq!(queue[0].bytes(), b"HTTP/1.1 200 OK\r\n");
    }

    #[test]
    fn partial_writes_resume_without_loss() {
        let pool = pool(16);
        let payload: Vec<u8> = (0..200u8).collect();
        let mut queue: VecDeque<StreamBuffer> = BufferChain::copy_from(&pool, &payload)
            .into_iter()
            .collect();
        queue.push_back(StreamBuffer::unpooled(&b"next response"[..]));

        let mut wire = LimitedWire::new(7, 3);
        let mut rounds = 0;
        loop {
            match drain_to_wire(&mut queue, &mut wire).expect("write failed") {
                WriteProgress::Complete => break,
                WriteProgress::Pending => {
                    rounds += 1;
                    wire.unblock(3);
                }
            }
        }
        assert!(rounds > 1);
        let mut expected = payload.clone();
        expected.extend_from_slice(b"next response");
        assert_eq!(wire.received, expected);
        assert!(queue.is_empty());
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn partial_write_reports_pending_immediately() {
        let mut queue = VecDeque::from(vec![StreamBuffer::unpooled(vec![1u8; 10])]);
        let mut wire = LimitedWire::new(4, usize::MAX);
        assert_eq!(
            drain_to_wire(&mut queue, &mut wire).expect("write failed"),
            WriteProgress::Pending
        );
        assert_eq!(wire.received.len(), 4);
        assert_eq!(queue[0].bytes().len(), 6);
    }

    #[test]
    fn file_region_is_sent_and_completed_once() {
        use std::io::{Seek, SeekFrom};

        let mut file = tempfile::tempfile().expect("tempfile");
        file.write_all(b"0123456789abcdef").expect("write file");
        file.seek(SeekFrom::Start(0)).expect("seek");

        let completions = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&completions);
        let region = FileRegion::new(file, 2, 10).on_complete(move |result| {
            assert!(result.is_ok());
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let mut queue = VecDeque::from(vec![
            StreamBuffer::unpooled(&b"<"[..]),
            StreamBuffer::file(region),
            StreamBuffer::unpooled(&b">"[..]),
        ]);

        let mut wire = LimitedWire::new(4, usize::MAX);
        while drain_to_wire(&mut queue, &mut wire).expect("write failed") == WriteProgress::Pending
        {}
        assert_eq!(wire.received, b"<23456789ab>");
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_file_region_reports_failure() {
        let file = tempfile::tempfile().expect("tempfile");
        let failed = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&failed);
        let region = FileRegion::new(file, 0, 5).on_complete(move |result| {
            assert!(result.is_err());
            seen.fetch_add(1, Ordering::SeqCst);
        });
        drop(StreamBuffer::file(region));
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn chain_copy_spans_buffers() {
        let pool = pool(4);
        let chain = BufferChain::copy_from(&pool, b"abcdefghij");
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.total_bytes(), 10);
        assert_eq!(chain.to_vec(), b"abcdefghij");
        chain.release();
        assert_eq!(pool.stats().outstanding, 0);
    }
}
