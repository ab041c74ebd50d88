//! The transport seam a migration flow reads its source stream from.
//!
//! A real socket's "shut down this direction" is a raw-handle operation that
//! stays callable while a concurrent task is blocked inside a read on the
//! same connection (half-close over TCP works the same way). Framed reading,
//! on the other hand, needs an owned, exclusively-borrowed byte stream. The
//! trait splits those two concerns instead of forcing one object to serve
//! both through `&mut self`.

use tokio::io::AsyncRead;

/// Which half of a duplex connection to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
    Both,
}

/// A migration source connection. Implemented by the embedder's real
/// connection type; tests use an in-memory double.
pub trait JournalSocket: Send + Sync {
    /// Hand over the read side for framing. Called at most once per
    /// connection; implementations may panic on a second call.
    fn take_reader(&self) -> Box<dyn AsyncRead + Unpin + Send>;

    /// Half-close `direction`. Safe to call while a reader obtained from
    /// [`take_reader`](Self::take_reader) is blocked in a read.
    fn shutdown(&self, direction: Direction);

    fn is_open(&self) -> bool;
}
