use super::sink::RecordSink;
use log::{error, info, trace, warn};
use procwatch_shared::frame::{FRAME_HEADER_LEN, decode_body};
use procwatch_shared::{FrameError, LogPayload, ShutdownRequest};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::net::TcpStream;

/// Async counterpart of [`procwatch_shared::decode_frame`], with the same end of stream rules.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<LogPayload>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buffer = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut len_buffer).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let expected = u32::from_be_bytes(len_buffer);

    let mut body = Vec::new();
    (&mut *reader)
        .take(expected as u64)
        .read_to_end(&mut body)
        .await?;

    decode_body(expected, &body).map(Some)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// The peer closed the connection between two frames
    Closed,
    /// The peer sent the shutdown sentinel
    ShutdownRequested(ShutdownRequest),
}

#[derive(Debug)]
pub struct ConnectionReport {
    pub peer: SocketAddr,
    /// Records appended to the sink
    pub records: u64,
    pub outcome: Result<ConnectionOutcome, FrameError>,
}

/// Read frames from one client until it disconnects, sends the sentinel, or breaks the protocol.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    sink: Arc<dyn RecordSink>,
) -> ConnectionReport {
    let mut reader = BufReader::new(stream);
    let mut records = 0;

    let outcome = loop {
        match read_frame(&mut reader).await {
            Ok(Some(LogPayload::Record(record))) => {
                trace!("{peer}: record from {}", record.logger);
                match sink.append(&record) {
                    Ok(()) => records += 1,
                    Err(e) => error!("Failed to write record from {peer}: {e}"),
                }
            }
            Ok(Some(LogPayload::Shutdown(request))) => {
                info!(
                    "Shutdown requested by {} (pid {}) from {peer}",
                    request.requester, request.pid
                );
                break Ok(ConnectionOutcome::ShutdownRequested(request));
            }
            Ok(None) => break Ok(ConnectionOutcome::Closed),
            Err(e) => {
                warn!("Dropping connection from {peer}: {e}");
                break Err(e);
            }
        }
    };

    ConnectionReport {
        peer,
        records,
        outcome,
    }
}
