//! Bounded byte channel between a chunk's extractor and its loader.
//!
//! The writer hands over frames of encoded CSV records and suspends while
//! `capacity` frames are already queued. The stream ends only through an
//! explicit [`BridgeWriter::close`]; a writer that fails or is dropped
//! without closing surfaces on the reader as [`MigrateError::StreamAborted`],
//! so the loader never commits a partial stream and never waits forever.

use crate::error::{MigrateError, Result};
use bytes::Bytes;
use tokio::sync::mpsc;

#[derive(Debug)]
enum Frame {
    Data(Bytes),
    End,
    Abort(String),
}

/// Create a bridge holding at most `capacity` frames in flight.
pub fn channel(capacity: usize) -> (BridgeWriter, BridgeReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (BridgeWriter { tx }, BridgeReader { rx, done: false })
}

/// Producer half.
#[derive(Debug)]
pub struct BridgeWriter {
    tx: mpsc::Sender<Frame>,
}

impl BridgeWriter {
    /// Queue one frame, waiting for room if the bridge is full.
    ///
    /// Fails with [`MigrateError::StreamClosed`] once the reader is gone.
    pub async fn write(&self, frame: Bytes) -> Result<()> {
        if frame.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Frame::Data(frame))
            .await
            .map_err(|_| MigrateError::StreamClosed)
    }

    /// Mark the end of the stream.
    pub async fn close(self) -> Result<()> {
        self.tx
            .send(Frame::End)
            .await
            .map_err(|_| MigrateError::StreamClosed)
    }

    /// Abort the stream. The reader sees [`MigrateError::StreamAborted`].
    pub async fn fail(self, reason: impl Into<String>) {
        // Nobody left to tell if the reader is already gone.
        let _ = self.tx.send(Frame::Abort(reason.into())).await;
    }

    /// True once the reader has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half.
#[derive(Debug)]
pub struct BridgeReader {
    rx: mpsc::Receiver<Frame>,
    done: bool,
}

impl BridgeReader {
    /// Next frame, `Ok(None)` after a clean close.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(Frame::Data(bytes)) => Ok(Some(bytes)),
            Some(Frame::End) => {
                self.done = true;
                self.rx.close();
                Ok(None)
            }
            Some(Frame::Abort(reason)) => {
                self.rx.close();
                Err(MigrateError::StreamAborted(reason))
            }
            None => Err(MigrateError::StreamAborted(
                "producer went away without closing the stream".to_string(),
            )),
        }
    }
}
