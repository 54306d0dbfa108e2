//! `bridge` command: the client protocol over stdin/stdout.
//!
//! Each stdin line is one JSON request; each stdout line is one JSON message.
//! Diagnostics go to stderr through the logger.

use anyhow::Result;
use flashbridge::{ServerMessage, Service};
use log::{debug, info};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::config::Settings;

/// Serve one client session until stdin closes or Ctrl+C.
pub(crate) async fn cmd_bridge(settings: &Settings) -> Result<()> {
    let service = Service::init(settings.bridge.clone());
    let (outbound, mut messages) = mpsc::unbounded_channel::<ServerMessage>();
    let session = service.session(outbound);
    info!("Bridge ready (session {})", session.id());

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = messages.recv().await {
            let mut line = message.to_json();
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {},
                Some(line) => session.handle_text(line.trim()).await,
                None => {
                    debug!("stdin closed");
                    break;
                },
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.close().await;
    service.shutdown().await;
    // every sender is gone once the session closed, so the writer drains and exits
    writer.await?;
    Ok(())
}
