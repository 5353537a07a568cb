//! Unix-socket JSON-line control plane.
//!
//! One request per line, one response per line. The socket carries the two
//! operator-facing operations: `trigger-cycle` and `resume`. Parsing happens
//! at the boundary ([`crate::protocol`]); malformed input gets an error
//! response and never reaches the engine.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info};

use crate::engine::Engine;
use crate::protocol::{ControlRequest, ControlResponse};

/// Maximum accepted request line length.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Accepts control connections until the listener errors.
///
/// # Errors
///
/// Returns the underlying I/O error if `accept` fails.
pub async fn serve(engine: Arc<Engine>, listener: UnixListener) -> std::io::Result<()> {
    info!("control plane listening");
    loop {
        let (stream, _addr) = listener.accept().await?;
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(engine, stream).await {
                debug!(%err, "control connection closed with error");
            }
        });
    }
}

async fn handle_connection(engine: Arc<Engine>, stream: UnixStream) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = if line.len() > MAX_LINE_BYTES {
            ControlResponse::Error {
                message: "request too large".to_string(),
            }
        } else {
            dispatch(&engine, &line).await
        };

        let mut encoded = serde_json::to_string(&response).unwrap_or_else(|_| {
            r#"{"result":"error","message":"response encoding failed"}"#.to_string()
        });
        encoded.push('\n');
        writer.write_all(encoded.as_bytes()).await?;
    }
    Ok(())
}

/// Parses and serves one control request.
pub async fn dispatch(engine: &Arc<Engine>, line: &str) -> ControlResponse {
    match serde_json::from_str::<ControlRequest>(line) {
        Ok(ControlRequest::TriggerCycle { max_sessions }) => {
            ControlResponse::Cycle(engine.run_cycle(max_sessions).await)
        },
        Ok(ControlRequest::Resume { token, outcome }) => {
            match engine.resume(&token, outcome).await {
                Ok(response) => ControlResponse::Resume(response),
                Err(err) => {
                    error!(%err, "resume failed on storage");
                    ControlResponse::Error {
                        message: "internal storage error".to_string(),
                    }
                },
            }
        },
        Err(err) => ControlResponse::Error {
            message: format!("invalid request: {err}"),
        },
    }
}
