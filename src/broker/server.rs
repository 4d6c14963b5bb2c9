//! Socket side of the broker.

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::packet::{Packet, PacketReader};
use super::{BrokerHandle, ClientId, Outgoing, TARGET};

/// Accept connections until `cancel` fires.
pub async fn serve(listener: TcpListener, broker: BrokerHandle, cancel: CancellationToken) -> Result<()> {
    loop {
        let (stream, addr) = tokio::select! {
            r = listener.accept() => r.context("accepting broker connection")?,
            _ = cancel.cancelled() => break,
        };
        log::debug!(target: TARGET, "connection from {}", addr);
        let broker = broker.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, broker, cancel).await {
                log::debug!(target: TARGET, "connection from {} ended: {:#}", addr, e);
            }
        });
    }
    Ok(())
}

/// Run one client connection to completion. Works on any byte stream.
pub async fn handle_connection<S>(stream: S, broker: BrokerHandle, cancel: CancellationToken) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (tx, rx) = mpsc::channel(broker.limits().outgoing_queue);
    let id = broker.register(tx).await?;
    let (mut rd, wr) = tokio::io::split(stream);

    let closed = cancel.child_token();
    let writer = tokio::spawn(write_loop(wr, rx, closed.clone()));
    let result = read_loop(&mut rd, id, &broker, &closed).await;

    // teardown is idempotent, the broker may already have closed us
    _ = broker.close(id).await;
    closed.cancel();
    match writer.await {
        Ok(Err(e)) => log::debug!(target: TARGET, "{} write failed: {:#}", id, e),
        Err(e) => log::warn!(target: TARGET, "{} writer task failed: {}", id, e),
        Ok(Ok(())) => {}
    }
    result
}

async fn read_loop<R>(rd: &mut R, id: ClientId, broker: &BrokerHandle, closed: &CancellationToken) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let idle = broker.limits().idle_timeout;
    let mut reader = PacketReader::new(broker.limits().max_packet);
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
        reader.push(&buf[..n]);
        while let Some(packet) = reader.next_packet().context(format!("decoding packet from {}", id))? {
            log::trace!(target: TARGET, "{} <- {:?}", id, packet);
            let disconnect = packet == Packet::Disconnect;
            broker.packet(id, packet).await?;
            if disconnect {
                return Ok(());
            }
        }
    }
}

async fn write_loop<W>(mut wr: W, mut rx: mpsc::Receiver<Outgoing>, closed: CancellationToken) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let result: Result<()> = async {
        loop {
            let out = tokio::select! {
                out = rx.recv() => out,
                _ = closed.cancelled() => None,
            };
            match out {
                Some(Outgoing::Packet(p)) => {
                    let data = p.encode()?;
                    wr.write_all(&data).await.context("writing socket")?;
                }
                Some(Outgoing::Close) | None => break,
            }
        }
        _ = wr.shutdown().await;
        Ok(())
    }
    .await;
    // wake reader when the broker closed us or the socket failed
    closed.cancel();
    result
}
