use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytepipe_transport::Descriptor;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::block::Block;
use crate::error::{Result, StreamError};
use crate::multiplexer::{Direction, Multiplexer};

/// A FIFO byte stream stored as a chain of fixed-size [`Block`]s.
///
/// Writes append at the tail, reads drain from the head, and nothing is
/// ever copied into one large contiguous region. Blocks emptied by a read
/// are parked in a rollback pool until the next read, so the bytes that
/// read returned can be pushed back with [`ChunkedBuffer::rollback`].
///
/// `ChunkedBuffer` is a cheap handle: clones share the same stream. The
/// multiplexer only holds a [`WeakBuffer`], so the stream lives exactly as
/// long as application code keeps a handle.
///
/// # Thread Safety
///
/// One writer at the tail and one reader at the head may run concurrently
/// (typically the multiplexer on one side and the application on the other).
/// Reading from a buffer that the multiplexer is also draining to an output
/// descriptor gives an unspecified interleaving and should be avoided.
///
/// # Example
///
/// ```
/// use bytepipe_stream::ChunkedBuffer;
///
/// let buffer = ChunkedBuffer::with_block_capacity(4);
/// buffer.write(b"ABCDEFGHIJ");
///
/// let head = buffer.read(Some(7));
/// assert_eq!(&head[..], b"ABCDEFG");
///
/// buffer.rollback(7).unwrap();
/// assert_eq!(&buffer.read(None)[..], b"ABCDEFGHIJ");
/// ```
#[derive(Clone)]
pub struct ChunkedBuffer {
    inner: Arc<BufferInner>,
}

/// Non-owning handle to a [`ChunkedBuffer`].
#[derive(Clone)]
pub struct WeakBuffer {
    inner: Weak<BufferInner>,
}

struct BufferInner {
    block_capacity: usize,
    chain: Mutex<Chain>,
    unread: AtomicUsize,
    closed: AtomicBool,
    finished: AtomicBool,
    attachments: Mutex<Attachments>,
}

#[derive(Default)]
struct Chain {
    blocks: VecDeque<Arc<Block>>,
    // blocks retired by the most recent read, most recent last
    pool: Vec<Arc<Block>>,
    last_read: usize,
}

#[derive(Default)]
struct Attachments {
    input: Option<RawFd>,
    output: Option<RawFd>,
}

impl ChunkedBuffer {
    /// Create an empty buffer with the default block capacity.
    pub fn new() -> Self {
        Self::with_block_capacity(Block::DEFAULT_CAPACITY)
    }

    /// Create an empty buffer whose blocks hold `capacity` bytes each.
    pub fn with_block_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                block_capacity: capacity.max(1),
                chain: Mutex::new(Chain::default()),
                unread: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                attachments: Mutex::new(Attachments::default()),
            }),
        }
    }

    /// Create a buffer pre-filled with `data`.
    pub fn new_with(data: &[u8]) -> Self {
        let buffer = Self::new();
        buffer.write(data);
        buffer
    }

    /// Append `data`, allocating blocks as needed. Never blocks.
    pub fn write(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        // Count first so a concurrent reader can never drain more than was counted.
        self.inner.unread.fetch_add(data.len(), Ordering::AcqRel);

        let mut written = 0;
        while written < data.len() {
            let tail = self.writable_tail();
            written += tail.write(&data[written..]);
        }
        written
    }

    fn writable_tail(&self) -> Arc<Block> {
        let mut chain = self.inner.chain.lock();
        match chain.blocks.back() {
            Some(block) if !block.is_full() => Arc::clone(block),
            _ => {
                let block = Arc::new(Block::with_capacity(self.inner.block_capacity));
                chain.blocks.push_back(Arc::clone(&block));
                block
            }
        }
    }

    /// Read up to `n` bytes, or everything available when `n` is `None`.
    ///
    /// Starts a new rollback window: only the bytes returned by this call can
    /// be rolled back afterwards.
    pub fn read(&self, n: Option<usize>) -> Bytes {
        let mut chain = self.inner.chain.lock();
        chain.pool.clear();

        let available = self.len();
        let mut out = BytesMut::with_capacity(n.map_or(available, |n| n.min(available)));

        while let Some(head) = chain.blocks.front().cloned() {
            let want = match n {
                Some(n) => n - out.len(),
                None => head.capacity(),
            };
            head.read(want, &mut out);

            if !head.is_exhausted() {
                break;
            }
            if let Some(retired) = chain.blocks.pop_front() {
                chain.pool.push(retired);
            }
            if n.is_some_and(|n| out.len() >= n) {
                break;
            }
        }

        chain.last_read = out.len();
        self.inner.unread.fetch_sub(out.len(), Ordering::AcqRel);
        out.freeze()
    }

    /// Push the last `n` bytes returned by [`ChunkedBuffer::read`] back onto
    /// the front of the stream, without copying.
    ///
    /// Rolling back more than the previous read returned is a caller bug and
    /// fails with [`StreamError::RollbackExceeded`], leaving the buffer untouched.
    pub fn rollback(&self, n: usize) -> Result<()> {
        if n == 0 {
            return Ok(());
        }

        let mut chain = self.inner.chain.lock();
        if n > chain.last_read {
            error!(
                requested = n,
                available = chain.last_read,
                "rollback larger than previous read"
            );
            return Err(StreamError::RollbackExceeded {
                requested: n,
                available: chain.last_read,
            });
        }

        let mut residual = match chain.blocks.front() {
            Some(head) => head.rollback(n),
            None => n,
        };
        while residual > 0 {
            let Some(block) = chain.pool.pop() else {
                return Err(StreamError::RollbackExceeded {
                    requested: n,
                    available: n - residual,
                });
            };
            residual = block.rollback(residual);
            chain.blocks.push_front(block);
        }

        chain.last_read -= n;
        self.inner.unread.fetch_add(n, Ordering::AcqRel);
        Ok(())
    }

    /// Unread bytes.
    pub fn len(&self) -> usize {
        self.inner.unread.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live blocks (excluding the rollback pool).
    pub fn block_count(&self) -> usize {
        self.inner.chain.lock().blocks.len()
    }

    /// Number of blocks retired by the last read and still available for rollback.
    pub fn pool_len(&self) -> usize {
        self.inner.chain.lock().pool.len()
    }

    pub fn block_capacity(&self) -> usize {
        self.inner.block_capacity
    }

    /// Bind a readable descriptor through the process-wide multiplexer.
    ///
    /// Bytes arriving on `descriptor` are appended to this buffer until it
    /// reaches end-of-stream.
    pub fn attach_input(&self, descriptor: impl Descriptor + 'static) -> Result<()> {
        self.attach_input_with(Multiplexer::global(), descriptor)
    }

    /// Bind a writable descriptor through the process-wide multiplexer.
    ///
    /// Bytes in this buffer are drained into `descriptor` as it accepts them.
    pub fn attach_output(&self, descriptor: impl Descriptor + 'static) -> Result<()> {
        self.attach_output_with(Multiplexer::global(), descriptor)
    }

    /// Bind a readable descriptor through an explicit multiplexer.
    pub fn attach_input_with(
        &self,
        mux: &Multiplexer,
        descriptor: impl Descriptor + 'static,
    ) -> Result<()> {
        self.attach(mux, Box::new(descriptor), Direction::Read)
    }

    /// Bind a writable descriptor through an explicit multiplexer.
    pub fn attach_output_with(
        &self,
        mux: &Multiplexer,
        descriptor: impl Descriptor + 'static,
    ) -> Result<()> {
        self.attach(mux, Box::new(descriptor), Direction::Write)
    }

    fn attach(
        &self,
        mux: &Multiplexer,
        descriptor: Box<dyn Descriptor>,
        direction: Direction,
    ) -> Result<()> {
        let mut attachments = self.inner.attachments.lock();
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        let slot = match direction {
            Direction::Read => &mut attachments.input,
            Direction::Write => &mut attachments.output,
        };
        if slot.is_some() {
            return Err(StreamError::AlreadyAttached { direction });
        }

        let fd = descriptor.raw_fd();
        mux.register(self.downgrade(), descriptor, direction)?;
        *slot = Some(fd);
        debug!(fd, %direction, "buffer attached");
        Ok(())
    }

    /// Stop multiplexer activity for this buffer.
    ///
    /// Attached descriptors are released by the multiplexer on its next
    /// tick. Bytes already buffered stay readable.
    pub fn close(&self) {
        let mut attachments = self.inner.attachments.lock();
        attachments.input = None;
        attachments.output = None;
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!("buffer closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Declare that nothing more will be written.
    ///
    /// An attached output descriptor is closed, and this buffer with it, as
    /// soon as the multiplexer has drained every byte into it. Use this to
    /// deliver end-of-stream to a child process's stdin.
    pub fn finish(&self) {
        self.inner.finished.store(true, Ordering::Release);
    }

    /// Whether [`ChunkedBuffer::finish`] has been called.
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    /// Non-owning handle, as held by the multiplexer.
    pub fn downgrade(&self) -> WeakBuffer {
        WeakBuffer {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl Default for ChunkedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChunkedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkedBuffer")
            .field("len", &self.len())
            .field("block_capacity", &self.inner.block_capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl io::Read for ChunkedBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = ChunkedBuffer::read(self, Some(buf.len()));
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

impl io::Write for ChunkedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(ChunkedBuffer::write(self, buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl WeakBuffer {
    /// A strong handle, or `None` once every owner has dropped the buffer.
    pub fn upgrade(&self) -> Option<ChunkedBuffer> {
        self.inner.upgrade().map(|inner| ChunkedBuffer { inner })
    }

    /// True while at least one owner still holds the buffer.
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl fmt::Debug for WeakBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakBuffer")
            .field("alive", &self.is_alive())
            .finish()
    }
}
