//! Older appliance generation: JSON documents in length-prefixed frames over plain TCP.
//!
//! The first frame names the device (`Header["x-lgedm-deviceId"]`), its model comes from
//! the configured device table. Status blocks arrive base64 encoded in `Body.Data` when
//! `Body.Format` is `"B64"`. Every frame which is not itself a reply gets acknowledged.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::devman::{DeviceLink, DeviceMetadata, NewDevice};
use crate::frame::length_prefixed;

const TARGET: &str = "legacy";
const DEVICE_ID_HEADER: &str = "x-lgedm-deviceId";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyDevice {
    pub model: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyConfig {
    pub port: Option<u16>,
    /// device id -> model
    pub devices: HashMap<String, LegacyDevice>,
    pub idle_timeout_secs: u64,
    pub max_frame: usize,
}

impl Default for LegacyConfig {
    fn default() -> Self {
        Self {
            port: None,
            devices: HashMap::new(),
            // devices send keep-alive every 60 seconds
            idle_timeout_secs: 90,
            max_frame: length_prefixed::DEFAULT_MAX_PAYLOAD,
        }
    }
}

struct Binding {
    connection: u64,
    close: CancellationToken,
}

pub struct LegacyManager {
    config: LegacyConfig,
    queue: usize,
    next_connection: AtomicU64,
    registry: std::sync::Mutex<HashMap<String, Binding>>,
    new_devices: mpsc::UnboundedSender<NewDevice>,
}

fn ack(id: &str, request: &serde_json::Value) -> serde_json::Value {
    json!({
        "Header": { DEVICE_ID_HEADER: id },
        "Body": {
            "CmdWId": request.pointer("/Body/CmdWId").cloned().unwrap_or(serde_json::Value::Null),
            "ReturnCode": "0000",
        }
    })
}

/// Wrap command body for sending, every command gets a fresh id.
fn command(id: &str, body: &[u8]) -> Result<serde_json::Value> {
    let mut body: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(body).context("command body is not a json object")?;
    body.insert(
        "CmdWId".to_owned(),
        format!("n-{}", hex::encode(rand::random::<[u8; 16]>())).into(),
    );
    Ok(json!({
        "Header": { DEVICE_ID_HEADER: id },
        "Body": body,
    }))
}

impl LegacyManager {
    pub fn new(config: LegacyConfig, queue: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<NewDevice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let m = Arc::new(Self {
            config,
            queue,
            next_connection: AtomicU64::new(1),
            registry: std::sync::Mutex::new(HashMap::new()),
            new_devices: tx,
        });
        (m, rx)
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        loop {
            let (stream, addr) = tokio::select! {
                r = listener.accept() => r.context("accepting legacy connection")?,
                _ = cancel.cancelled() => break,
            };
            log::debug!(target: TARGET, "connection from {}", addr);
            let me = self.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = me.handle_connection(stream, cancel).await {
                    log::debug!(target: TARGET, "connection from {} ended: {:#}", addr, e);
                }
            });
        }
        Ok(())
    }

    /// Connection currently bound to device `id`.
    pub fn is_bound(&self, id: &str) -> Result<bool> {
        let reg = self.registry.lock().map_err(|e| anyhow::anyhow!("registry lock: {}", e))?;
        Ok(reg.contains_key(id))
    }

    fn bind(&self, id: &str, connection: u64, close: CancellationToken) -> Result<()> {
        let mut reg = self.registry.lock().map_err(|e| anyhow::anyhow!("registry lock: {}", e))?;
        if let Some(old) = reg.insert(id.to_owned(), Binding { connection, close }) {
            log::warn!(target: TARGET, "device {} already connected, dropping the old connection", id);
            old.close.cancel();
        }
        Ok(())
    }

    fn unbind(&self, id: &str, connection: u64) -> Result<()> {
        let mut reg = self.registry.lock().map_err(|e| anyhow::anyhow!("registry lock: {}", e))?;
        if reg.get(id).map(|b| b.connection) == Some(connection) {
            reg.remove(id);
        }
        Ok(())
    }

    pub async fn handle_connection<S>(self: Arc<Self>, stream: S, cancel: CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (mut rd, wr) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(self.queue);
        let closed = cancel.child_token();
        let writer = tokio::spawn(write_loop(wr, rx, closed.clone()));

        let mut bound: Option<(String, DeviceLink)> = None;
        let result = self.read_loop(&mut rd, connection, &tx, &closed, &mut bound).await;

        if let Some((id, link)) = bound {
            self.unbind(&id, connection)?;
            drop(link);
            log::info!(target: TARGET, "device {} disconnected", id);
        }
        closed.cancel();
        drop(tx);
        if let Err(e) = writer.await {
            log::warn!(target: TARGET, "writer task failed: {}", e);
        }
        result
    }

    async fn read_loop<R>(
        &self,
        rd: &mut R,
        connection: u64,
        tx: &mpsc::Sender<Vec<u8>>,
        closed: &CancellationToken,
        bound: &mut Option<(String, DeviceLink)>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let idle = Duration::from_secs(self.config.idle_timeout_secs);
        let mut splitter = length_prefixed::Splitter::new(self.config.max_frame);
        let mut buf = vec![0u8; 4096];
        loop {
            let n = tokio::select! {
                r = tokio::time::timeout(idle, rd.read(&mut buf)) => {
                    r.context("idle timeout")?.context("reading socket")?
                }
                _ = closed.cancelled() => return Ok(()),
            };
            if n == 0 {
                return Ok(());
            }
            for frame in splitter.push(&buf[..n])? {
                let text = String::from_utf8_lossy(&frame);
                log::info!(target: "incoming", "{}", text);
                let request: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!(target: TARGET, "invalid frame: {}", e);
                        continue;
                    }
                };
                let Some(id) = request.pointer(&format!("/Header/{}", DEVICE_ID_HEADER)).and_then(|v| v.as_str())
                else {
                    log::warn!(target: TARGET, "frame without device id");
                    continue;
                };

                if bound.is_none() {
                    let Some(model) = self.config.devices.get(id) else {
                        log::warn!(target: TARGET, "device {} not configured, closing", id);
                        return Ok(());
                    };
                    self.bind(id, connection, closed.clone())?;
                    let (link, device, outbound) = DeviceLink::create(id, self.queue);
                    tokio::spawn(forward_outbound(outbound, tx.clone(), id.to_owned()));
                    let meta = DeviceMetadata {
                        id: id.to_owned(),
                        model_id: model.model.clone(),
                        model_name: model.name.clone(),
                        firmware: None,
                    };
                    *bound = Some((id.to_owned(), link));
                    if self.new_devices.send(NewDevice { device, meta }).is_err() {
                        log::warn!(target: TARGET, "nobody is listening for new devices");
                    }
                }

                if let Some((_, link)) = bound.as_ref() {
                    let body = &request["Body"];
                    if body["Format"] == "B64" {
                        if let Some(data) = body["Data"].as_str() {
                            match base64::engine::general_purpose::STANDARD.decode(data) {
                                Ok(status) => link.deliver(status),
                                Err(e) => log::warn!(target: TARGET, "{}: invalid status data: {}", id, e),
                            }
                        }
                    }
                }

                if request.pointer("/Body/ReturnCode").is_none() {
                    tx.send(ack(id, &request).to_string().into_bytes())
                        .await
                        .map_err(|_| anyhow::anyhow!("writer is gone"))?;
                }
            }
        }
    }
}

async fn forward_outbound(mut rx: mpsc::Receiver<Vec<u8>>, tx: mpsc::Sender<Vec<u8>>, id: String) {
    while let Some(body) = rx.recv().await {
        let doc = match command(&id, &body) {
            Ok(doc) => doc,
            Err(e) => {
                log::warn!(target: TARGET, "{}: {:#}", id, e);
                continue;
            }
        };
        log::debug!(target: "outgoing", "{} {}", id, doc);
        if tx.send(doc.to_string().into_bytes()).await.is_err() {
            break;
        }
    }
}

async fn write_loop<W>(mut wr: W, mut rx: mpsc::Receiver<Vec<u8>>, closed: CancellationToken) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let doc = tokio::select! {
            doc = rx.recv() => doc,
            _ = closed.cancelled() => None,
        };
        let Some(doc) = doc else {
            break;
        };
        if let Err(e) = wr.write_all(&length_prefixed::make(&doc)).await {
            log::debug!(target: TARGET, "write failed: {}", e);
            closed.cancel();
            break;
        }
    }
    _ = wr.shutdown().await;
    Ok(())
}
