//! Scriptable socket stand-ins shared by unit tests.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::Notify;

use crate::connection::SendStream;

/// Captures everything written, always accepting.
pub(crate) struct CaptureStream {
    written: Mutex<Vec<u8>>,
}

impl CaptureStream {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self { written: Mutex::new(Vec::new()) })
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }
}

impl SendStream for CaptureStream {
    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        self.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn writable(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Accepts a byte budget, then reports `WouldBlock` until topped up.
pub(crate) struct ScriptedStream {
    accept: AtomicUsize,
    written: Mutex<Vec<u8>>,
    wakeup: Notify,
}

impl ScriptedStream {
    pub(crate) fn new(initial_budget: usize) -> Arc<Self> {
        Arc::new(Self { accept: AtomicUsize::new(initial_budget), written: Mutex::new(Vec::new()), wakeup: Notify::new() })
    }

    pub(crate) fn allow(&self, bytes: usize) {
        self.accept.fetch_add(bytes, Ordering::SeqCst);
        self.wakeup.notify_waiters();
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }
}

impl SendStream for ScriptedStream {
    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        let budget = self.accept.load(Ordering::SeqCst);
        if budget == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = budget.min(buf.len());
        self.accept.fetch_sub(n, Ordering::SeqCst);
        self.written.lock().unwrap().extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn writable(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async {
            while self.accept.load(Ordering::SeqCst) == 0 {
                self.wakeup.notified().await;
            }
            Ok(())
        })
    }
}

/// Fails every operation; for error-path coverage.
pub(crate) struct BrokenStream;

impl SendStream for BrokenStream {
    fn try_write(&self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::ErrorKind::BrokenPipe.into())
    }

    fn writable(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async { Err(io::ErrorKind::BrokenPipe.into()) })
    }
}
