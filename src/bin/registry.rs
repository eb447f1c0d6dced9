use std::{env, net::SocketAddr, sync::Arc};

use concord::{
    event::Session,
    net::{session::Udp, MessageNet},
    registry::{self, Replica, ReplicaEvent},
};
use tokio::net::UdpSocket;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let mut args = env::args().skip(1);
    let usage = || anyhow::anyhow!("usage: registry <udp-addr> <initial-balance>");
    let addr = args.next().ok_or_else(usage)?.parse::<SocketAddr>()?;
    let initial_balance = args.next().ok_or_else(usage)?.parse::<u64>()?;

    let socket = Udp(Arc::new(UdpSocket::bind(addr).await?));
    let mut session = Session::<ReplicaEvent<SocketAddr>>::new();
    let mut replica = Replica::new(
        initial_balance,
        MessageNet::<_, registry::Reply<SocketAddr>>::new(socket.clone()),
    );

    let recv_session = socket.recv_session({
        let mut sender = session.sender();
        move |buf| registry::replica_on_buf::<SocketAddr>(buf, &mut sender)
    });
    info!("registry on {addr}, every account opens with {initial_balance}");
    tokio::select! {
        result = recv_session => result?,
        result = session.run(&mut replica) => result?,
        result = tokio::signal::ctrl_c() => return Ok(result?),
    }
    anyhow::bail!("unreachable")
}
