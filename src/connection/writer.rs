//! Dedicated writer task with batched outbound writes.
//!
//! Each connection's write half is owned by its own task, so a slow peer
//! stalls only the writes and never the read loop:
//!
//! ```text
//! WorkerHandle::send ─┐
//! keep-alive tick ────┴─► mpsc<OutboundFrame> ─► writer task ─► socket
//!                                                     │
//!                        ConnectionWorker ◄─ WriteReport
//! ```
//!
//! Frames are drained in batches of up to [`MAX_BATCH_SIZE`] and written with
//! scatter/gather I/O, so a burst of small tracking messages costs one
//! syscall instead of one per message.

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clock;
use crate::codec::PackedMessage;
use crate::error::{Result, TransportError};

/// Maximum frames to batch in a single write operation.
pub const MAX_BATCH_SIZE: usize = 64;

/// A packed message waiting to be written.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Encoded header.
    pub header: Bytes,
    /// Body bytes (can be empty for header-only messages).
    pub body: Bytes,
    /// When the caller asked for the send (ns).
    pub queued_at: u64,
    /// Heartbeats are not reported as `MessageSent`.
    pub keep_alive: bool,
}

impl OutboundFrame {
    /// Create a frame from a packed message.
    #[inline]
    pub fn new(packed: PackedMessage, queued_at: u64) -> Self {
        Self {
            header: packed.header,
            body: packed.body,
            queued_at,
            keep_alive: false,
        }
    }

    /// Create a heartbeat frame.
    #[inline]
    pub fn keep_alive(packed: PackedMessage, queued_at: u64) -> Self {
        Self {
            keep_alive: true,
            ..Self::new(packed, queued_at)
        }
    }

    /// Total size of this frame (header + body).
    #[inline]
    pub fn size(&self) -> usize {
        self.header.len() + self.body.len()
    }
}

/// Outcome of one batch, sent from the writer task to its worker.
#[derive(Debug)]
pub(crate) enum WriteReport {
    /// Batch written. Holds the queue timestamps of the non-heartbeat frames.
    Written { started: Vec<u64>, end_ns: u64 },
    /// A heartbeat-only batch failed. The writer keeps running.
    KeepAliveFailed(TransportError),
    /// A batch carrying messages failed. The writer has exited.
    Failed(TransportError),
}

/// Spawn the writer task for one connection.
///
/// The task runs until every frame sender is dropped, a message batch fails,
/// or it is aborted by its worker.
pub(crate) fn spawn_writer_task<W>(
    writer: W,
    frames: mpsc::Receiver<OutboundFrame>,
    reports: mpsc::UnboundedSender<WriteReport>,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(writer_loop(writer, frames, reports))
}

async fn writer_loop<W>(
    mut writer: W,
    mut frames: mpsc::Receiver<OutboundFrame>,
    reports: mpsc::UnboundedSender<WriteReport>,
) where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    while let Some(first) = frames.recv().await {
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match frames.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let report = match write_batch(&mut writer, &batch).await {
            Ok(()) => WriteReport::Written {
                started: batch
                    .iter()
                    .filter(|f| !f.keep_alive)
                    .map(|f| f.queued_at)
                    .collect(),
                end_ns: clock::now_nanos(),
            },
            Err(e) if batch.iter().all(|f| f.keep_alive) => WriteReport::KeepAliveFailed(e),
            Err(e) => {
                let _ = reports.send(WriteReport::Failed(e));
                return;
            }
        };
        batch.clear();

        if reports.send(report).is_err() {
            return;
        }
    }

    tracing::debug!("Writer task stopped");
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
pub async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for remaining data after `skip_bytes` were written.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        for part in [&frame.header, &frame.body] {
            let end = offset + part.len();
            if !part.is_empty() && skip_bytes < end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&part[start..]));
            }
            offset = end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Write half of a socket whose peer has gone away.
    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn frame(header_len: usize, body: &'static [u8]) -> OutboundFrame {
        OutboundFrame::new(
            PackedMessage {
                header: Bytes::from(vec![0xAA; header_len]),
                body: Bytes::from_static(body),
            },
            0,
        )
    }

    #[test]
    fn test_outbound_frame_size() {
        let frame = frame(58, b"hello");
        assert_eq!(frame.size(), 63);
        assert!(!frame.keep_alive);
    }

    #[test]
    fn test_keep_alive_flag() {
        let packed = PackedMessage {
            header: Bytes::from_static(&[1, 2, 3]),
            body: Bytes::new(),
        };
        let frame = OutboundFrame::keep_alive(packed, 7);
        assert!(frame.keep_alive);
        assert_eq!(frame.queued_at, 7);
    }

    #[test]
    fn test_build_remaining_slices_no_skip() {
        let batch = vec![frame(10, b"hello")];
        let slices = build_remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 2);
    }

    #[test]
    fn test_build_remaining_slices_partial_header() {
        let batch = vec![frame(10, b"hello")];
        let slices = build_remaining_slices(&batch, 4);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), 6);
        assert_eq!(slices[1].len(), 5);
    }

    #[test]
    fn test_build_remaining_slices_skip_header() {
        let batch = vec![frame(10, b"hello")];
        let slices = build_remaining_slices(&batch, 10);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), 5);
    }

    #[test]
    fn test_build_remaining_slices_empty_body_skipped() {
        let batch = vec![frame(10, b""), frame(10, b"abc")];
        let slices = build_remaining_slices(&batch, 12);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), 8);
        assert_eq!(slices[1].len(), 3);
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|_| frame(58, b"abc")).collect();

        write_batch(&mut buf, &batch).await.unwrap();

        assert_eq!(buf.into_inner().len(), 5 * (58 + 3));
    }

    #[tokio::test]
    async fn test_write_batch_preserves_order() {
        let mut buf = Cursor::new(Vec::new());
        let batch = vec![frame(2, b"first"), frame(2, b"second")];

        write_batch(&mut buf, &batch).await.unwrap();

        let written = buf.into_inner();
        assert_eq!(&written[2..7], b"first");
        assert_eq!(&written[9..], b"second");
    }

    #[tokio::test]
    async fn test_writer_task_reports_batches() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let (frames_tx, frames_rx) = mpsc::channel(8);
        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
        let task = spawn_writer_task(client, frames_rx, reports_tx);

        frames_tx.send(frame(58, b"abc")).await.unwrap();
        let mut buf = vec![0u8; 61];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf[58..], b"abc");

        match reports_rx.recv().await.unwrap() {
            WriteReport::Written { started, .. } => assert_eq!(started, vec![0]),
            other => panic!("unexpected report {:?}", other),
        }

        // Closing the queue ends the task.
        drop(frames_tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_writer_task_survives_keep_alive_failure() {
        let (frames_tx, frames_rx) = mpsc::channel(8);
        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
        let task = spawn_writer_task(BrokenPipe, frames_rx, reports_tx);

        let heartbeat = PackedMessage {
            header: Bytes::from_static(&[0; 58]),
            body: Bytes::new(),
        };
        frames_tx
            .send(OutboundFrame::keep_alive(heartbeat, 1))
            .await
            .unwrap();
        assert!(matches!(
            reports_rx.recv().await,
            Some(WriteReport::KeepAliveFailed(_))
        ));
        assert!(!task.is_finished());

        frames_tx.send(frame(58, b"data")).await.unwrap();
        assert!(matches!(
            reports_rx.recv().await,
            Some(WriteReport::Failed(_))
        ));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_write_batch_partial_writes() {
        // A tiny duplex buffer forces write_vectored to return short counts.
        let (mut client, mut server) = tokio::io::duplex(16);
        let batch = vec![frame(58, b"payload"), frame(58, b"more")];
        let expected: usize = batch.iter().map(|f| f.size()).sum();

        let reader = tokio::spawn(async move {
            let mut all = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut server, &mut all)
                .await
                .unwrap();
            all
        });

        write_batch(&mut client, &batch).await.unwrap();
        drop(client);

        let all = reader.await.unwrap();
        assert_eq!(all.len(), expected);
        assert_eq!(&all[58..65], b"payload");
    }
}
