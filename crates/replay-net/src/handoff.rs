// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Byte-stream pumps for the handoff.
//!
//! The origin writes its [`TransportStream`] as framed packets with
//! [`write_transport`]; the consumer decodes them into a [`ClientTransport`]
//! with [`read_transport`]. [`consume_handoff`] also runs rerun recovery
//! once the stream ends, cleanly or not.

use replay_core::{ClientTransport, RegistryError, TransportStream};
use replay_proto::wire::{encode_event, FrameDecoder, WireError};
use replay_proto::RequestKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::network::ReplayNetwork;

/// Failures while pumping the handoff.
#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    /// The byte stream failed.
    #[error("handoff io: {0}")]
    Io(#[from] std::io::Error),
    /// A packet could not be encoded or decoded.
    #[error("handoff wire: {0}")]
    Wire(#[from] WireError),
    /// The consumer registry rejected an event.
    #[error("handoff registry: {0}")]
    Registry(#[from] RegistryError),
}

/// Write every event of `stream` to `writer` until the transport closes.
///
/// Returns the number of events written.
pub async fn write_transport<W>(
    mut stream: TransportStream,
    writer: &mut W,
) -> Result<usize, HandoffError>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0usize;
    while let Some(event) = stream.recv().await {
        let packet = encode_event(&event)?;
        writer.write_all(&packet).await?;
        writer.flush().await?;
        written += 1;
    }
    writer.shutdown().await?;
    debug!(written, "handoff writer finished");
    Ok(written)
}

/// Decode packets from `reader` into `client` until EOF.
///
/// Returns the number of events delivered. Bytes left over at EOF (a torn
/// packet) are reported and dropped.
pub async fn read_transport<R>(
    reader: &mut R,
    client: &ClientTransport,
    max_payload: usize,
) -> Result<usize, HandoffError>
where
    R: AsyncRead + Unpin,
{
    let mut read_buf: Vec<u8> = vec![0u8; 16 * 1024];
    let mut decoder = FrameDecoder::with_max_payload(max_payload);
    let mut delivered = 0usize;
    loop {
        let n = reader.read(&mut read_buf).await?;
        if n == 0 {
            break;
        }
        for event in decoder.push(&read_buf[..n])? {
            client.push_event(event)?;
            delivered += 1;
        }
    }
    if decoder.buffered() > 0 {
        warn!(bytes = decoder.buffered(), "handoff ended inside a packet");
    }
    Ok(delivered)
}

/// Pump `reader` into `client`, then re-issue every request the origin left
/// unfinished through `network`.
///
/// `client` should already be attached to `network`'s registry. Returns the
/// number of events delivered before the stream ended.
pub async fn consume_handoff<R>(
    reader: &mut R,
    client: &ClientTransport,
    network: &ReplayNetwork,
) -> usize
where
    R: AsyncRead + Unpin,
{
    let delivered = match read_transport(reader, client, network.config().max_frame_bytes).await
    {
        Ok(delivered) => {
            info!(delivered, "handoff stream ended");
            delivered
        }
        Err(err) => {
            warn!(error = %err, "handoff stream failed");
            0
        }
    };
    let rerun = network.registry().rerun_all_simulated(network);
    if !rerun.is_empty() {
        let keys: Vec<&str> = rerun.iter().map(RequestKey::as_str).collect();
        warn!(count = rerun.len(), ?keys, "re-issued requests abandoned by the handoff");
    }
    delivered
}
