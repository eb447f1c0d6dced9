use std::{
    collections::BTreeMap, env, future::IntoFuture, net::SocketAddr, sync::Arc, time::Duration,
};

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use concord::{
    coordinator::{
        self, Coordinator, Event, Inspect, Status, Transfer, TransferDone, TransferOutcome,
    },
    event::{SendEvent, Session, SessionSender},
    net::{session::Udp, Directory, DirectoryNet, MessageNet},
    registry::{self, Client, ClientEvent, Invoke, InvokeOk, Op, OpOk},
};
use tokio::{
    net::UdpSocket,
    sync::{mpsc::unbounded_channel, oneshot},
};
use tracing::{info, warn};

#[derive(Clone)]
struct App {
    sender: SessionSender<Event<SocketAddr>>,
}

async fn status(State(app): State<App>) -> Result<Json<Status>, StatusCode> {
    let (sender, receiver) = oneshot::channel();
    app.sender
        .clone()
        .send(Inspect(sender))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let status = receiver
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(status))
}

async fn transfer(
    State(app): State<App>,
    Json(transfer): Json<Transfer>,
) -> Result<(StatusCode, Json<serde_json::Value>), StatusCode> {
    let body = serde_json::json!({ "dst": transfer.dst, "amount": transfer.amount });
    app.sender
        .clone()
        .send(transfer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok((StatusCode::ACCEPTED, Json(body)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let mut args = env::args().skip(1);
    let usage =
        || anyhow::anyhow!("usage: node <udp-addr> <http-addr> <registry-addr> <cluster-size>");
    let addr = args.next().ok_or_else(usage)?.parse::<SocketAddr>()?;
    let http_addr = args.next().ok_or_else(usage)?.parse::<SocketAddr>()?;
    let registry_addr = args.next().ok_or_else(usage)?.parse::<SocketAddr>()?;
    let cluster_size = args.next().ok_or_else(usage)?.parse::<usize>()?;

    let socket = Udp(Arc::new(UdpSocket::bind(addr).await?));
    let registry_socket = Udp(Arc::new(
        UdpSocket::bind(SocketAddr::new(addr.ip(), 0)).await?,
    ));
    let client_addr = registry_socket.0.local_addr()?;

    let (invoke_ok_sender, mut invoke_ok_receiver) = unbounded_channel::<InvokeOk<SocketAddr>>();
    let mut client_session = Session::<ClientEvent<SocketAddr>>::new();
    let mut client_sender = client_session.sender();
    let mut client = Client::new(
        rand::random(),
        client_addr,
        registry_addr,
        MessageNet::<_, registry::Request<SocketAddr>>::new(registry_socket.clone()),
        invoke_ok_sender,
    );
    let client_recv_task = tokio::spawn({
        let socket = registry_socket.clone();
        let mut sender = client_session.sender();
        async move {
            socket
                .recv_session(move |buf| registry::client_on_buf::<SocketAddr>(buf, &mut sender))
                .await
        }
    });
    let client_task = tokio::spawn(async move { client_session.run(&mut client).await });

    client_sender.send(Invoke(Op::Register { endpoint: addr }))?;
    let Some(InvokeOk(OpOk::Registered {
        node_id,
        initial_balance,
        peers,
    })) = invoke_ok_receiver.recv().await
    else {
        anyhow::bail!("unexpected registry reply")
    };
    info!("registered as node {node_id} with balance {initial_balance}");
    let mut entries = peers.into_iter().collect::<BTreeMap<_, _>>();
    while entries.len() < cluster_size {
        tokio::time::sleep(Duration::from_millis(500)).await;
        client_sender.send(Invoke(Op::Peers))?;
        let Some(InvokeOk(OpOk::Peers(peers))) = invoke_ok_receiver.recv().await else {
            anyhow::bail!("unexpected registry reply")
        };
        entries = peers.into_iter().collect();
    }
    let directory = Directory::new(node_id, entries)?;
    info!(
        "directory complete: peers {:?}",
        directory.peers().collect::<Vec<_>>()
    );

    let mut coordinator_session = Session::<Event<SocketAddr>>::new();
    let (done_sender, mut done_receiver) = unbounded_channel::<TransferDone>();
    let mut coordinator = Coordinator::new(
        node_id,
        directory.clone(),
        initial_balance,
        MessageNet::<_, coordinator::Message>::new(DirectoryNet::new(directory, socket.clone())),
        done_sender,
        client_sender,
    );

    let recv_session = socket.recv_session({
        let mut sender = coordinator_session.sender();
        move |buf| coordinator::on_buf(buf, &mut sender)
    });
    let settle_session = {
        let mut sender = coordinator_session.sender();
        async move {
            while let Some(invoke_ok) = invoke_ok_receiver.recv().await {
                sender.send(invoke_ok)?
            }
            anyhow::Ok(())
        }
    };
    let done_session = async move {
        while let Some(done) = done_receiver.recv().await {
            match done.outcome {
                TransferOutcome::Committed => {
                    info!("transfer of {} to {} committed", done.amount, done.dst)
                }
                TransferOutcome::Aborted => {
                    warn!("transfer of {} to {} aborted", done.amount, done.dst)
                }
                TransferOutcome::Rejected => {
                    warn!("transfer of {} to {} rejected", done.amount, done.dst)
                }
            }
        }
        anyhow::Ok(())
    };
    let app = Router::new()
        .route("/status", get(status))
        .route("/transfer", post(transfer))
        .with_state(App {
            sender: coordinator_session.sender(),
        });
    let http_listener = tokio::net::TcpListener::bind(http_addr).await?;
    info!("operator surface on {http_addr}");

    tokio::select! {
        result = recv_session => result?,
        result = coordinator_session.run(&mut coordinator) => result?,
        result = settle_session => result?,
        result = done_session => result?,
        result = axum::serve(http_listener, app).into_future() => result?,
        result = client_task => result??,
        result = client_recv_task => result??,
        result = tokio::signal::ctrl_c() => return Ok(result?),
    }
    anyhow::bail!("unreachable")
}
