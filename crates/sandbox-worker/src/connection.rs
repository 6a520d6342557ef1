//! Line-protocol transport between a byte stream and a worker.

use sandbox_proto::{Decoder, Inbound, ProtocolError, Response};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::WorkerResult;
use crate::worker::{Events, WorkerHandle, id_label};

const READ_BUF_SIZE: usize = 64 * 1024;

/// Serve one connection until the input closes and every accepted request
/// has been answered.
///
/// Responses are written in emission order. Malformed lines are answered
/// with an `error` message; lines with an unknown `kind` are skipped.
pub async fn serve<R, W>(
    mut reader: R,
    mut writer: W,
    handle: WorkerHandle,
    mut events: Events,
) -> WorkerResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut decoder = Decoder::new();
    let mut read_buf = vec![0u8; READ_BUF_SIZE];
    // Dropped at end of input so the worker drains its queue and exits.
    let mut handle = Some(handle);

    loop {
        tokio::select! {
            read = reader.read(&mut read_buf), if handle.is_some() => {
                let n = read?;
                let frames: Vec<Result<Vec<u8>, ProtocolError>> = if n == 0 {
                    debug!("input closed");
                    decoder.finish().into_iter().map(Ok).collect()
                } else {
                    decoder.decode(read_buf.get(..n).unwrap_or_default())
                };

                if let Some(h) = &handle {
                    for frame in frames {
                        match frame {
                            Ok(line) => dispatch(&line, h, &mut writer).await?,
                            Err(e) => {
                                warn!(error = %e, "discarding input");
                                write_response(&mut writer, &Response::error(None, e.to_string()))
                                    .await?;
                            }
                        }
                    }
                }
                if n == 0 {
                    handle = None;
                }
            }
            event = events.next() => {
                let Some(response) = event else {
                    break;
                };
                write_response(&mut writer, &response).await?;
            }
        }
    }

    info!("connection finished");
    Ok(())
}

async fn dispatch<W>(line: &[u8], handle: &WorkerHandle, writer: &mut W) -> WorkerResult<()>
where
    W: AsyncWrite + Unpin,
{
    match sandbox_proto::parse_request(line) {
        Ok(Inbound::Request(request)) => {
            debug!(id = %id_label(request.id()), "request accepted");
            handle.submit(request).await
        }
        Ok(Inbound::Ignored(kind)) => {
            debug!(kind = %kind, "ignoring message");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "malformed message");
            let id = sandbox_proto::request_id_hint(line);
            write_response(writer, &Response::error(id, e.to_string())).await
        }
    }
}

async fn write_response<W>(writer: &mut W, response: &Response) -> WorkerResult<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = match sandbox_proto::encode(response) {
        Ok(bytes) => bytes,
        Err(e @ ProtocolError::MessageTooLarge(_)) => {
            warn!(id = %id_label(response.id()), error = %e, "response too large");
            sandbox_proto::encode(&Response::error(response.id().cloned(), e.to_string()))?
        }
        Err(e) => return Err(e.into()),
    };
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
