//! Subprocess pipe transport
//!
//! Line-delimited JSON-RPC over stdin/stdout, one request at a time - the
//! protocol's handshake ordering makes serial processing safe. The local
//! pipe carries no authorization layer; that belongs to the HTTP transport.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::dispatch::{ConnectionState, Dispatcher};
use crate::error::Result;
use crate::protocol::{McpRequest, McpResponse};

/// The pipe is a single connection; this names it in the dispatcher's
/// in-flight registry.
const STDIO_CONN: &str = "stdio";

pub struct StdioServer {
    dispatcher: Arc<Dispatcher>,
}

impl StdioServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Serve until stdin reaches EOF. Malformed lines get a -32700 response.
    pub async fn run(&self) -> Result<()> {
        let stdin = tokio::io::stdin();
        let mut stdout = tokio::io::stdout();
        let mut lines = BufReader::new(stdin).lines();
        let mut state = ConnectionState::Uninitialized;

        tracing::info!("stdio transport ready");

        while let Some(line) = lines.next_line().await? {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<McpRequest>(trimmed) {
                Ok(request) => {
                    self.dispatcher
                        .handle(STDIO_CONN, &mut state, request, None)
                        .await
                }
                Err(e) => Some(McpResponse::error(
                    None,
                    -32700,
                    format!("Parse error: {e}"),
                )),
            };

            if let Some(response) = response {
                let mut payload = serde_json::to_string(&response)?;
                payload.push('\n');
                stdout.write_all(payload.as_bytes()).await?;
                stdout.flush().await?;
            }
        }

        self.dispatcher.cancel_connection(STDIO_CONN);
        tracing::info!("stdin closed, shutting down");
        Ok(())
    }
}
