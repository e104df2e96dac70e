use std::fmt::Debug;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use tracewire_proto::dto::span::ExportBatch;

/// Errors raised by a transport send.
///
/// `Transient` failures are retried with backoff; `Fatal` failures drop
/// the batch immediately. Both end with the batch counted as dropped if
/// the retry budget runs out.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transient transport failure: {0}")]
    Transient(String),
    #[error("fatal transport failure: {0}")]
    Fatal(String),
}

/// Abstract collaborator that ships a batch of serialized spans.
///
/// The core dictates only the contract: batched, best-effort, retried
/// on transient failure. The wire protocol belongs to the
/// implementation.
#[async_trait]
pub trait Transport: Debug + Send + Sync {
    async fn send(&self, batch: &ExportBatch) -> Result<(), TransportError>;
}

/// Ships batches as newline-delimited JSON over TCP.
///
/// Connects per batch; any I/O error is transient, and the retry path
/// reconnects from scratch.
#[derive(Debug)]
pub struct TcpTransport {
    addr: String,
}

impl TcpTransport {
    pub fn new<A: Into<String>>(addr: A) -> Self {
        TcpTransport { addr: addr.into() }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, batch: &ExportBatch) -> Result<(), TransportError> {
        let mut line = serde_json::to_vec(batch)
            .map_err(|e| TransportError::Fatal(format!("serialize batch {}: {e}", batch.seq)))?;
        line.push(b'\n');

        let mut stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| TransportError::Transient(format!("connect {}: {e}", self.addr)))?;
        stream
            .write_all(&line)
            .await
            .map_err(|e| TransportError::Transient(format!("write {}: {e}", self.addr)))?;
        stream
            .shutdown()
            .await
            .map_err(|e| TransportError::Transient(format!("shutdown {}: {e}", self.addr)))?;
        Ok(())
    }
}

/// In-process transport that captures batches, for tests and local
/// diagnostics. `fail_next` makes the next n sends fail transiently to
/// exercise the retry path.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    batches: Mutex<Vec<ExportBatch>>,
    fail_remaining: AtomicU32,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: u32) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<ExportBatch> {
        self.batches.lock().unwrap().clone()
    }

    /// Total number of spans across all captured batches.
    pub fn span_count(&self) -> usize {
        self.batches.lock().unwrap().iter().map(|b| b.len()).sum()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, batch: &ExportBatch) -> Result<(), TransportError> {
        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Transient("injected failure".to_string()));
        }
        self.batches.lock().unwrap().push(batch.clone());
        Ok(())
    }
}
