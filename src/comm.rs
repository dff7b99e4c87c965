use core::fmt;
use core::ops::Range;

use std::sync::{Arc, Barrier, Mutex};

/// Reduction applied elementwise across ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
}

impl ReduceOp {
    fn combine(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Sum => a + b,
            // NaN must survive a max/min so divergence is seen on every rank.
            Self::Max => {
                if a.is_nan() || a > b {
                    a
                } else {
                    b
                }
            }
            Self::Min => {
                if a.is_nan() || a < b {
                    a
                } else {
                    b
                }
            }
        }
    }
}

/// Errors raised by the reduction layer.
#[derive(Debug, Clone)]
pub enum CommError {
    /// A rooted reduction named a root outside `0..size`.
    InvalidRoot { root: usize, size: usize },
    /// Send and receive buffers (or contributions from different ranks) disagree in length.
    LengthMismatch { expected: usize, actual: usize },
    /// A peer rank went away while holding shared state.
    Disconnected,
}

impl fmt::Display for CommError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRoot { root, size } => {
                write!(f, "root {root} is not a rank of a communicator of size {size}")
            }
            Self::LengthMismatch { expected, actual } => {
                write!(f, "buffer length {actual} does not match expected {expected}")
            }
            Self::Disconnected => write!(f, "peer rank disconnected"),
        }
    }
}

impl std::error::Error for CommError {}

/// Collective operations over the ranks that share a partitioned vector.
///
/// Every rank must issue the same sequence of calls with the same operation;
/// each call blocks until all ranks have contributed.
pub trait Communicator {
    /// Index of this rank in `0..size()`.
    fn rank(&self) -> usize;
    /// Number of participating ranks.
    fn size(&self) -> usize;
    /// Block until every rank reaches the barrier.
    fn barrier(&self) -> Result<(), CommError>;
    /// Reduce `send` elementwise across ranks into `recv` on every rank.
    fn all_reduce(&self, send: &[f64], recv: &mut [f64], op: ReduceOp) -> Result<(), CommError>;
    /// Reduce `send` elementwise across ranks into `recv` on `root` only.
    fn reduce(
        &self,
        send: &[f64],
        recv: &mut [f64],
        op: ReduceOp,
        root: usize,
    ) -> Result<(), CommError>;
    /// Concatenate every rank's `send` in rank order into `recv`.
    fn all_gather(&self, send: &[f64], recv: &mut [f64]) -> Result<(), CommError>;
}

fn check_len(expected: usize, actual: usize) -> Result<(), CommError> {
    if expected != actual {
        return Err(CommError::LengthMismatch { expected, actual });
    }
    Ok(())
}

/// Single-process communicator: rank 0 of size 1, reductions copy `send` to `recv`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<(), CommError> {
        Ok(())
    }

    fn all_reduce(&self, send: &[f64], recv: &mut [f64], _op: ReduceOp) -> Result<(), CommError> {
        check_len(send.len(), recv.len())?;
        recv.copy_from_slice(send);
        Ok(())
    }

    fn reduce(
        &self,
        send: &[f64],
        recv: &mut [f64],
        op: ReduceOp,
        root: usize,
    ) -> Result<(), CommError> {
        if root != 0 {
            return Err(CommError::InvalidRoot { root, size: 1 });
        }
        self.all_reduce(send, recv, op)
    }

    fn all_gather(&self, send: &[f64], recv: &mut [f64]) -> Result<(), CommError> {
        check_len(send.len(), recv.len())?;
        recv.copy_from_slice(send);
        Ok(())
    }
}

struct Shared {
    size: usize,
    barrier: Barrier,
    slots: Mutex<Vec<Vec<f64>>>,
}

/// In-process communicator: one handle per thread, all sharing the same slots.
///
/// Create a group with [`ThreadComm::group`] and move one handle into each
/// worker thread.
pub struct ThreadComm {
    rank: usize,
    shared: Arc<Shared>,
}

impl fmt::Debug for ThreadComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadComm")
            .field("rank", &self.rank)
            .field("size", &self.shared.size)
            .finish()
    }
}

impl ThreadComm {
    /// Create `size` connected handles, ordered by rank.
    pub fn group(size: usize) -> Vec<Self> {
        let shared = Arc::new(Shared {
            size,
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![Vec::new(); size]),
        });
        (0..size)
            .map(|rank| Self {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    // Deposit, wait for everyone, read back, wait again so slots can be reused.
    // Validation happens after the exchange so no rank leaves a barrier early.
    fn exchange(&self, send: &[f64]) -> Result<Vec<Vec<f64>>, CommError> {
        let deposited = match self.shared.slots.lock() {
            Ok(mut slots) => {
                slots[self.rank].clear();
                slots[self.rank].extend_from_slice(send);
                true
            }
            Err(_) => false,
        };
        self.shared.barrier.wait();
        let gathered = self
            .shared
            .slots
            .lock()
            .map(|slots| slots.clone())
            .map_err(|_| CommError::Disconnected);
        self.shared.barrier.wait();
        if !deposited {
            return Err(CommError::Disconnected);
        }
        gathered
    }

    fn fold(parts: &[Vec<f64>], len: usize, op: ReduceOp, recv: &mut [f64]) -> Result<(), CommError> {
        for part in parts {
            check_len(len, part.len())?;
        }
        for (i, out) in recv.iter_mut().enumerate() {
            let mut acc = parts[0][i];
            for part in &parts[1..] {
                acc = op.combine(acc, part[i]);
            }
            *out = acc;
        }
        Ok(())
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) -> Result<(), CommError> {
        self.shared.barrier.wait();
        Ok(())
    }

    fn all_reduce(&self, send: &[f64], recv: &mut [f64], op: ReduceOp) -> Result<(), CommError> {
        let parts = self.exchange(send)?;
        check_len(send.len(), recv.len())?;
        Self::fold(&parts, send.len(), op, recv)
    }

    fn reduce(
        &self,
        send: &[f64],
        recv: &mut [f64],
        op: ReduceOp,
        root: usize,
    ) -> Result<(), CommError> {
        if root >= self.shared.size {
            return Err(CommError::InvalidRoot {
                root,
                size: self.shared.size,
            });
        }
        let parts = self.exchange(send)?;
        if self.rank != root {
            return Ok(());
        }
        check_len(send.len(), recv.len())?;
        Self::fold(&parts, send.len(), op, recv)
    }

    fn all_gather(&self, send: &[f64], recv: &mut [f64]) -> Result<(), CommError> {
        let parts = self.exchange(send)?;
        let total = parts.iter().map(Vec::len).sum();
        check_len(total, recv.len())?;
        let mut offset = 0;
        for part in &parts {
            recv[offset..offset + part.len()].copy_from_slice(part);
            offset += part.len();
        }
        Ok(())
    }
}

/// Contiguous block of `0..len` owned by `rank` when split across `size` ranks.
///
/// The first `len % size` ranks receive one extra entry.
pub fn block_range(len: usize, rank: usize, size: usize) -> Range<usize> {
    if size == 0 {
        return 0..0;
    }
    let base = len / size;
    let extra = len % size;
    let start = rank * base + rank.min(extra);
    let count = base + usize::from(rank < extra);
    start.min(len)..(start + count).min(len)
}
