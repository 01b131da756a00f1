use bytes::BytesMut;
use parking_lot::Mutex;

/// A fixed-capacity byte segment with independent read and write cursors.
///
/// Invariant: `0 <= read_pos <= write_pos <= capacity`. A block is
/// exhausted once a read moves `read_pos` to `capacity`; a rollback clears
/// that state again.
#[derive(Debug)]
pub struct Block {
    capacity: usize,
    state: Mutex<BlockState>,
}

#[derive(Debug)]
struct BlockState {
    // write cursor is data.len()
    data: Vec<u8>,
    read_pos: usize,
    exhausted: bool,
}

impl Block {
    /// Default capacity: 256 KiB.
    pub const DEFAULT_CAPACITY: usize = 256 * 1024;

    /// Create an empty block with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Create an empty block. A zero capacity is raised to one byte.
    ///
    /// Memory is allocated as data arrives, never beyond `capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(BlockState {
                data: Vec::new(),
                read_pos: 0,
                exhausted: false,
            }),
        }
    }

    /// Append as much of `data` as fits. Returns the number of bytes taken.
    pub fn write(&self, data: &[u8]) -> usize {
        let mut state = self.state.lock();
        let room = self.capacity - state.data.len();
        let n = room.min(data.len());
        let needed = state.data.len() + n;
        if needed > state.data.capacity() {
            let target = needed.max(state.data.capacity() * 2).min(self.capacity);
            let extra = target - state.data.len();
            state.data.reserve_exact(extra);
        }
        state.data.extend_from_slice(&data[..n]);
        n
    }

    /// Move up to `n` unread bytes into `dst`. Returns the number moved.
    pub fn read(&self, n: usize, dst: &mut BytesMut) -> usize {
        let mut state = self.state.lock();
        let start = state.read_pos;
        let end = start + n.min(state.data.len() - start);
        dst.extend_from_slice(&state.data[start..end]);
        state.read_pos = end;
        if end == self.capacity {
            state.exhausted = true;
        }
        end - start
    }

    /// Move the read cursor back by up to `n` bytes.
    ///
    /// Returns the part of `n` this block could not absorb, which belongs to
    /// the block before it.
    pub fn rollback(&self, n: usize) -> usize {
        let mut state = self.state.lock();
        state.exhausted = false;
        if state.read_pos < n {
            let residual = n - state.read_pos;
            state.read_pos = 0;
            residual
        } else {
            state.read_pos -= n;
            0
        }
    }

    /// True once every byte of the block has been written and read.
    pub fn is_exhausted(&self) -> bool {
        self.state.lock().exhausted
    }

    /// True once no more bytes can be written.
    pub fn is_full(&self) -> bool {
        self.state.lock().data.len() == self.capacity
    }

    /// Bytes written but not yet read.
    pub fn unread(&self) -> usize {
        let state = self.state.lock();
        state.data.len() - state.read_pos
    }

    /// Bytes read so far; the most a rollback into this block can restore.
    pub fn consumed(&self) -> usize {
        self.state.lock().read_pos
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}
