use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

/// An image larger than this is rejected outright.
const MAX_IMAGE_BYTES: u64 = 16 * 1024 * 1024;
/// The header line is read through a limit of this many bytes, so a peer
/// that never sends a newline cannot grow the buffer.
const MAX_HEADER_BYTES: u64 = 1024;
/// A pushing client gets this long for the whole transfer.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

/// Serviced once per tick; the scheduler only needs "serviced", not a result.
#[async_trait]
pub trait UpdateService: Send {
    async fn service(&mut self);
}

/// Header line sent by the push tool before the raw image bytes.
#[derive(Debug, Serialize, Deserialize)]
pub struct PushHeader {
    pub password: String,
    pub size: u64,
}

/// Accepts an externally pushed firmware image over the network and stages it
/// for the host's updater to apply. One pending push is handled per tick;
/// with nothing pending, servicing returns immediately.
pub struct UpdateListener {
    listener: TcpListener,
    password: String,
    staging_path: PathBuf,
}

impl UpdateListener {
    pub async fn bind(
        addr: SocketAddr,
        password: impl Into<String>,
        staging_path: PathBuf,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind update listener on {addr}"))?;
        info!("Update listener on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            password: password.into(),
            staging_path,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    async fn handle_push(&self, stream: TcpStream) -> anyhow::Result<()> {
        let mut reader = BufReader::new(stream);

        let mut header_line = String::new();
        (&mut reader)
            .take(MAX_HEADER_BYTES)
            .read_line(&mut header_line)
            .await
            .context("failed to read push header")?;
        if !header_line.ends_with('\n') {
            bail!("push header too long or truncated");
        }
        let header: PushHeader =
            serde_json::from_str(header_line.trim()).context("malformed push header")?;

        if header.password != self.password {
            let _ = reader.get_mut().write_all(b"ERR bad password\n").await;
            bail!("rejected push: bad password");
        }
        if header.size == 0 || header.size > MAX_IMAGE_BYTES {
            let _ = reader.get_mut().write_all(b"ERR bad image size\n").await;
            bail!("rejected push: image size {} out of range", header.size);
        }

        let mut file = tokio::fs::File::create(&self.staging_path)
            .await
            .with_context(|| format!("failed to create {}", self.staging_path.display()))?;
        let mut limited = (&mut reader).take(header.size);
        let copied = tokio::io::copy(&mut limited, &mut file)
            .await
            .context("image transfer failed")?;
        if copied != header.size {
            let _ = reader.get_mut().write_all(b"ERR short image\n").await;
            bail!("push ended early: {copied} of {} bytes", header.size);
        }
        file.flush().await.context("failed to flush staged image")?;

        reader
            .get_mut()
            .write_all(b"OK\n")
            .await
            .context("failed to acknowledge push")?;
        info!(
            "Staged firmware image, {copied} bytes at {}",
            self.staging_path.display()
        );
        Ok(())
    }
}

#[async_trait]
impl UpdateService for UpdateListener {
    async fn service(&mut self) {
        // Zero timeout turns accept() into a single poll of the backlog.
        let pending =
            match tokio::time::timeout(Duration::from_millis(0), self.listener.accept()).await {
                Err(_) => return, // nothing pending this tick
                Ok(Err(e)) => {
                    warn!("Update listener accept failed: {e}");
                    return;
                }
                Ok(Ok(accepted)) => accepted,
            };

        let (stream, peer) = pending;
        let outcome = tokio::time::timeout(TRANSFER_TIMEOUT, self.handle_push(stream)).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Update push from {peer} failed: {e:#}"),
            Err(_) => warn!("Update push from {peer} timed out"),
        }
    }
}
