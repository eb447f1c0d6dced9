use std::{net::SocketAddr, sync::Arc};

use tokio::net::UdpSocket;
use tracing::warn;

use super::{Buf, SendMessage};

#[derive(Debug, Clone)]
pub struct Udp(pub Arc<UdpSocket>);

impl Udp {
    pub async fn recv_session(
        &self,
        mut on_buf: impl FnMut(&[u8]) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let mut buf = vec![0; 1 << 16];
        loop {
            let (len, _) = self.0.recv_from(&mut buf).await?;
            on_buf(&buf[..len])?
        }
    }
}

impl<B: Buf> SendMessage<SocketAddr, B> for Udp {
    fn send(&mut self, dest: SocketAddr, buf: B) -> anyhow::Result<()> {
        let socket = self.0.clone();
        // one-way unreliable interface: a failed send is indistinguishable
        // from a lost datagram, so log and move on. loss is recovered by
        // protocol level retransmission
        tokio::spawn(async move {
            if let Err(err) = socket.send_to(buf.as_ref(), dest).await {
                warn!(">>> {dest} {err}")
            }
        });
        Ok(())
    }
}
