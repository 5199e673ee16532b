use std::collections::VecDeque;
use std::io::{self, Read};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

use crate::ReadClose;

/// Reader that replays a fixed sequence of read results, then reports end of stream.
///
/// Each step is delivered by exactly one read call; a step larger than the
/// caller's buffer is split across calls.
pub(crate) struct ScriptedReader {
    steps: VecDeque<io::Result<Vec<u8>>>,
    pub(crate) reads: Arc<AtomicUsize>,
    pub(crate) closes: Arc<AtomicUsize>,
    close_error: Option<io::ErrorKind>,
}

impl ScriptedReader {
    pub(crate) fn new(steps: Vec<io::Result<Vec<u8>>>) -> Self {
        Self {
            steps: steps.into(),
            reads: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
            close_error: None,
        }
    }

    /// `n` chunks of `chunk_size` bytes each; byte values count up so content can be checked.
    pub(crate) fn chunks(n: usize, chunk_size: usize) -> Self {
        let steps = (0..n)
            .map(|i| Ok((0..chunk_size).map(|j| ((i * chunk_size + j) % 251) as u8).collect()))
            .collect();
        Self::new(steps)
    }

    pub(crate) fn failing_close(mut self, kind: io::ErrorKind) -> Self {
        self.close_error = Some(kind);
        self
    }

    fn next_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reads.fetch_add(1, Ordering::Relaxed);

        match self.steps.pop_front() {
            None => Ok(0),
            Some(Err(e)) => Err(e),
            Some(Ok(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    self.steps.push_front(Ok(data.split_off(n)));
                }
                Ok(n)
            },
        }
    }
}

impl Read for ScriptedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.next_read(buf)
    }
}

impl ReadClose for ScriptedReader {
    fn close(&mut self) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::Relaxed);
        match self.close_error {
            Some(kind) => Err(io::Error::new(kind, "scripted close failure")),
            None => Ok(()),
        }
    }
}

impl AsyncRead for ScriptedReader {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let n = this.next_read(buf.initialize_unfilled())?;
        buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

pub(crate) fn expected_bytes(n: usize, chunk_size: usize) -> Vec<u8> {
    (0..n * chunk_size).map(|k| (k % 251) as u8).collect()
}
