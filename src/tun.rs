//! TUN write channel and writer task
//!
//! The forwarding core never touches the TUN device directly: workers and
//! the ingress path enqueue [`TunBatch`]es on a shared channel, and a
//! single writer task emits each envelope's wire image to the device.
//!
//! A batch is one worker's primary datagram plus its fragments. Batching
//! is what keeps a fragmented response contiguous on the device even when
//! several workers are sending concurrently; within one sender, channel
//! order preserves submission order.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::packet::envelope::Envelope;

/// A group of envelopes written to the TUN device back-to-back.
pub type TunBatch = Vec<Envelope>;

/// Create the shared TUN write channel.
pub fn tun_channel(depth: usize) -> (mpsc::Sender<TunBatch>, mpsc::Receiver<TunBatch>) {
    mpsc::channel(depth)
}

/// Spawn the writer task: drain `rx` and write every envelope's wire
/// image to `device`, one datagram per write.
///
/// The task ends when the channel closes or the device write fails.
/// Envelopes are dropped, and their buffers released, as soon as they
/// are written.
pub fn spawn_tun_writer<W>(device: W, mut rx: mpsc::Receiver<TunBatch>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut device = device;
        while let Some(batch) = rx.recv().await {
            for envelope in batch {
                if let Err(err) = device.write_all(envelope.wire()).await {
                    warn!(%err, "tun write failed; writer exiting");
                    return;
                }
                trace!(len = envelope.wire().len(), "tun write");
            }
        }
    })
}
