use crate::tools::ToolServer;
use anyhow::{Context, Result};
use imsg_core::rpc::{
    decode_frame, encode_frame, FrameError, LineFrameReader, RpcRequest, RpcResponse,
    INTERNAL_ERROR, INVALID_REQUEST, JSONRPC_VERSION, PARSE_ERROR,
};
use imsg_query::StoreSource;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, info, warn};

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Reads one request per line and answers it before reading the next.
pub async fn serve_stream<S, R, W>(
    server: Arc<ToolServer<S>>,
    mut reader: R,
    mut writer: W,
    max_frame_bytes: usize,
) -> Result<()>
where
    S: StoreSource + Send + Sync + 'static,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    info!(event = "server_start", max_frame_bytes);
    let mut frames = LineFrameReader::new(max_frame_bytes);
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    let mut handled = 0u64;
    loop {
        let read = reader.read(&mut buf).await.context("read request frame")?;
        let batch = if read == 0 {
            frames.finish().into_iter().collect()
        } else {
            frames.push_chunk(&buf[..read])
        };
        for frame in batch {
            handled += 1;
            if let Some(response) = answer(&server, frame, max_frame_bytes).await {
                write_response(&mut writer, response, max_frame_bytes).await?;
            }
        }
        if read == 0 {
            break;
        }
    }
    info!(event = "server_stop", handled);
    Ok(())
}

pub async fn serve_stdio<S>(server: Arc<ToolServer<S>>, max_frame_bytes: usize) -> Result<()>
where
    S: StoreSource + Send + Sync + 'static,
{
    serve_stream(server, tokio::io::stdin(), tokio::io::stdout(), max_frame_bytes).await
}

async fn answer<S>(
    server: &Arc<ToolServer<S>>,
    frame: Result<Vec<u8>, FrameError>,
    max_frame_bytes: usize,
) -> Option<RpcResponse>
where
    S: StoreSource + Send + Sync + 'static,
{
    let request = match frame.and_then(|frame| decode_frame::<Value>(&frame, max_frame_bytes)) {
        Ok(request) => request,
        Err(err) => {
            warn!(event = "frame_rejected", error = %err);
            return Some(RpcResponse::failure(Value::Null, PARSE_ERROR, err.to_string()));
        }
    };
    let request = match validate_request(request) {
        Ok(request) => request,
        Err(rejected) => return Some(rejected),
    };

    let id = request.id.clone();
    let method = request.method.clone();
    let server = server.clone();
    match tokio::task::spawn_blocking(move || server.handle(request)).await {
        Ok(response) => response,
        Err(err) => {
            error!(event = "request_failed", method = %method, error = %err);
            id.map(|id| RpcResponse::failure(id, INTERNAL_ERROR, format!("internal error: {err}")))
        }
    }
}

fn validate_request(value: Value) -> Result<RpcRequest, RpcResponse> {
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let request = serde_json::from_value::<RpcRequest>(value).map_err(|err| {
        warn!(event = "request_rejected", error = %err);
        RpcResponse::failure(id.clone(), INVALID_REQUEST, err.to_string())
    })?;
    if request.jsonrpc != JSONRPC_VERSION {
        warn!(event = "request_rejected", jsonrpc = %request.jsonrpc);
        return Err(RpcResponse::failure(
            id,
            INVALID_REQUEST,
            format!("unsupported jsonrpc version: {:?}", request.jsonrpc),
        ));
    }
    Ok(request)
}

async fn write_response<W>(writer: &mut W, response: RpcResponse, max_frame_bytes: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = match encode_frame(&response, max_frame_bytes) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(event = "response_rejected", error = %err);
            let fallback = RpcResponse::failure(response.id, INTERNAL_ERROR, err.to_string());
            encode_frame(&fallback, max_frame_bytes).context("encode error response")?
        }
    };
    writer.write_all(&frame).await.context("write response")?;
    writer.flush().await.context("flush response")?;
    Ok(())
}
