use crate::error::{MuxError, Result};
use bytes::BytesMut;
use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    task::{Context, Poll, Waker},
};
use tokio::io::ReadBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushError {
    /// The bytes do not fit in the remaining capacity.
    Full,
    /// The read side is already closed.
    Closed,
}

#[derive(Debug)]
enum ReadEnd {
    Eof,
    Failed(MuxError),
}

#[derive(Debug)]
struct BufferState {
    data: BytesMut,
    end: Option<ReadEnd>,
    waker: Option<Waker>,
}

/// Receive-side bytes of one stream, filled by the session read task.
#[derive(Debug)]
pub(crate) struct InboundBuffer {
    state: Mutex<BufferState>,
    capacity: usize,
}

impl InboundBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(BufferState {
                data: BytesMut::new(),
                end: None,
                waker: None,
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, bytes: &[u8]) -> std::result::Result<(), PushError> {
        let mut state = self.lock();
        if state.end.is_some() {
            return Err(PushError::Closed);
        }
        if state.data.len() + bytes.len() > self.capacity {
            return Err(PushError::Full);
        }
        state.data.extend_from_slice(bytes);
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
        Ok(())
    }

    /// Copies buffered bytes into `buf`, returning how many were delivered.
    /// EOF and errors are only reported once the buffer is drained.
    pub fn poll_read(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<Result<usize>> {
        let mut state = self.lock();
        if !state.data.is_empty() {
            let n = buf.remaining().min(state.data.len());
            buf.put_slice(&state.data.split_to(n));
            return Poll::Ready(Ok(n));
        }
        match &state.end {
            Some(ReadEnd::Eof) => Poll::Ready(Ok(0)),
            Some(ReadEnd::Failed(err)) => Poll::Ready(Err(err.clone())),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    pub fn set_eof(&self) {
        self.close_with(ReadEnd::Eof);
    }

    pub fn set_error(&self, err: MuxError) {
        self.close_with(ReadEnd::Failed(err));
    }

    /// Drops buffered bytes and fails reads immediately.
    pub fn reset(&self, err: MuxError) {
        let mut state = self.lock();
        state.data.clear();
        state.end = Some(ReadEnd::Failed(err));
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.lock().end.is_some()
    }

    fn close_with(&self, end: ReadEnd) {
        let mut state = self.lock();
        if state.end.is_none() {
            state.end = Some(end);
        }
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }
}
