use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    event::{OnEvent, SendEvent, Timer, TimerId},
    net::{deserialize, events::Recv, Addr, SendMessage},
    NodeId,
};

pub type ClientId = u32;

const RESEND_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op<A> {
    Register { endpoint: A },
    Debit { node: NodeId, amount: u64 },
    Credit { node: NodeId, amount: u64 },
    Balance { node: NodeId },
    Peers,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpOk<A> {
    Registered {
        node_id: NodeId,
        initial_balance: u64,
        peers: Vec<(NodeId, A)>,
    },
    Accepted,
    Insufficient,
    Balance(u64),
    Peers(Vec<(NodeId, A)>),
    // the op named an account nobody registered
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request<A> {
    pub client_id: ClientId,
    pub client_addr: A,
    pub seq: u32,
    pub op: Op<A>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply<A> {
    pub seq: u32,
    pub result: OpOk<A>,
}

#[derive(Debug, Clone)]
pub struct Invoke<A>(pub Op<A>);

#[derive(Debug, Clone)]
pub struct InvokeOk<A>(pub OpOk<A>);

#[derive(Debug, derive_more::From)]
pub enum ClientEvent<A> {
    Invoke(Invoke<A>),
    Ingress(Recv<Reply<A>>),
    ResendTimeout,
}

#[derive(Debug)]
pub struct Client<N, U, A> {
    id: ClientId,
    addr: A,
    registry_addr: A,
    seq: u32,
    invoke: Option<ClientInvoke<A>>,

    net: N,
    upcall: U,
}

#[derive(Debug)]
struct ClientInvoke<A> {
    op: Op<A>,
    resend_timer: TimerId,
}

impl<N, U, A> Client<N, U, A> {
    pub fn new(id: ClientId, addr: A, registry_addr: A, net: N, upcall: U) -> Self {
        Self {
            id,
            addr,
            registry_addr,
            net,
            upcall,
            seq: 0,
            invoke: Default::default(),
        }
    }
}

impl<N: SendMessage<A, Request<A>>, U: SendEvent<InvokeOk<A>>, A: Addr> OnEvent<ClientEvent<A>>
    for Client<N, U, A>
{
    fn on_event(
        &mut self,
        event: ClientEvent<A>,
        timer: &mut dyn Timer<ClientEvent<A>>,
    ) -> anyhow::Result<()> {
        match event {
            ClientEvent::Invoke(Invoke(op)) => self.on_invoke(op, timer),
            ClientEvent::Ingress(Recv(reply)) => self.on_ingress(reply, timer),
            ClientEvent::ResendTimeout => self.on_resend_timeout(timer),
        }
    }
}

impl<N: SendMessage<A, Request<A>>, U: SendEvent<InvokeOk<A>>, A: Addr> Client<N, U, A> {
    fn on_invoke(&mut self, op: Op<A>, timer: &mut dyn Timer<ClientEvent<A>>) -> anyhow::Result<()> {
        anyhow::ensure!(self.invoke.is_none(), "concurrent invocation");
        self.seq += 1;
        let invoke = ClientInvoke {
            op,
            resend_timer: timer.set(RESEND_INTERVAL, ClientEvent::ResendTimeout)?,
        };
        self.invoke = Some(invoke);
        self.do_send()
    }

    fn on_resend_timeout(&mut self, timer: &mut dyn Timer<ClientEvent<A>>) -> anyhow::Result<()> {
        let Some(invoke) = &mut self.invoke else {
            // raced with the reply consuming the invocation
            return Ok(());
        };
        warn!("registry op seq {} resend", self.seq);
        invoke.resend_timer = timer.set(RESEND_INTERVAL, ClientEvent::ResendTimeout)?;
        self.do_send()
    }

    fn on_ingress(
        &mut self,
        reply: Reply<A>,
        timer: &mut dyn Timer<ClientEvent<A>>,
    ) -> anyhow::Result<()> {
        if reply.seq != self.seq {
            return Ok(());
        }
        let Some(invoke) = self.invoke.take() else {
            // duplicate reply to the already completed invocation
            return Ok(());
        };
        timer.unset(invoke.resend_timer)?;
        self.upcall.send(InvokeOk(reply.result))
    }

    fn do_send(&mut self) -> anyhow::Result<()> {
        let Some(invoke) = &self.invoke else {
            anyhow::bail!("missing invocation")
        };
        let request = Request {
            client_id: self.id,
            client_addr: self.addr.clone(),
            seq: self.seq,
            op: invoke.op.clone(),
        };
        self.net.send(self.registry_addr.clone(), request)
    }
}

pub type ReplicaEvent<A> = Recv<Request<A>>;

// single replica with at most once semantics: the last reply per client is
// cached so a retransmitted request is answered without reapplying its op
#[derive(Debug)]
pub struct Replica<N, A> {
    initial_balance: u64,
    next_id: NodeId,
    endpoints: BTreeMap<NodeId, A>,
    accounts: HashMap<NodeId, u64>,
    replies: HashMap<ClientId, Reply<A>>,

    net: N,
}

impl<N, A> Replica<N, A> {
    pub fn new(initial_balance: u64, net: N) -> Self {
        Self {
            initial_balance,
            net,
            next_id: 1,
            endpoints: Default::default(),
            accounts: Default::default(),
            replies: Default::default(),
        }
    }
}

impl<N: SendMessage<A, Reply<A>>, A: Addr> OnEvent<ReplicaEvent<A>> for Replica<N, A> {
    fn on_event(
        &mut self,
        Recv(request): ReplicaEvent<A>,
        _: &mut dyn Timer<ReplicaEvent<A>>,
    ) -> anyhow::Result<()> {
        if let Some(reply) = self.replies.get(&request.client_id) {
            if request.seq < reply.seq {
                return Ok(());
            }
            if request.seq == reply.seq {
                let reply = reply.clone();
                return self.net.send(request.client_addr, reply);
            }
        }
        debug!("{:?}", request.op);
        let reply = Reply {
            seq: request.seq,
            result: self.apply(request.op),
        };
        self.replies.insert(request.client_id, reply.clone());
        self.net.send(request.client_addr, reply)
    }
}

impl<N, A: Addr> Replica<N, A> {
    fn apply(&mut self, op: Op<A>) -> OpOk<A> {
        match op {
            Op::Register { endpoint } => {
                let node_id = self.next_id;
                self.next_id += 1;
                self.endpoints.insert(node_id, endpoint);
                self.accounts.insert(node_id, self.initial_balance);
                OpOk::Registered {
                    node_id,
                    initial_balance: self.initial_balance,
                    peers: self.peer_list(),
                }
            }
            Op::Debit { node, amount } => match self.accounts.get_mut(&node) {
                None => OpOk::Unknown,
                Some(balance) if *balance >= amount => {
                    *balance -= amount;
                    OpOk::Accepted
                }
                Some(_) => OpOk::Insufficient,
            },
            Op::Credit { node, amount } => match self.accounts.get_mut(&node) {
                None => OpOk::Unknown,
                Some(balance) => {
                    *balance = balance.saturating_add(amount);
                    OpOk::Accepted
                }
            },
            Op::Balance { node } => match self.accounts.get(&node) {
                None => OpOk::Unknown,
                Some(balance) => OpOk::Balance(*balance),
            },
            Op::Peers => OpOk::Peers(self.peer_list()),
        }
    }

    fn peer_list(&self) -> Vec<(NodeId, A)> {
        self.endpoints
            .iter()
            .map(|(id, endpoint)| (*id, endpoint.clone()))
            .collect()
    }
}

pub fn client_on_buf<A: Addr>(
    buf: &[u8],
    sender: &mut impl SendEvent<Recv<Reply<A>>>,
) -> anyhow::Result<()> {
    match deserialize(buf) {
        Ok(reply) => sender.send(Recv(reply)),
        Err(err) => {
            warn!("malformed registry reply: {err}");
            Ok(())
        }
    }
}

pub fn replica_on_buf<A: Addr>(
    buf: &[u8],
    sender: &mut impl SendEvent<Recv<Request<A>>>,
) -> anyhow::Result<()> {
    match deserialize(buf) {
        Ok(request) => sender.send(Recv(request)),
        Err(err) => {
            warn!("malformed registry request: {err}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::event::NullTimer;

    use super::*;

    #[derive(Debug)]
    struct CaptureNet<A, M>(Vec<(A, M)>);

    impl<A, M> Default for CaptureNet<A, M> {
        fn default() -> Self {
            Self(Vec::new())
        }
    }

    impl<A, M> SendMessage<A, M> for CaptureNet<A, M> {
        fn send(&mut self, dest: A, message: M) -> anyhow::Result<()> {
            self.0.push((dest, message));
            Ok(())
        }
    }

    #[derive(Debug)]
    struct CaptureUpcall<A>(Vec<OpOk<A>>);

    impl<A> Default for CaptureUpcall<A> {
        fn default() -> Self {
            Self(Vec::new())
        }
    }

    impl<A> SendEvent<InvokeOk<A>> for CaptureUpcall<A> {
        fn send(&mut self, InvokeOk(result): InvokeOk<A>) -> anyhow::Result<()> {
            self.0.push(result);
            Ok(())
        }
    }

    type TestReplica = Replica<CaptureNet<u32, Reply<u32>>, u32>;

    fn request(client_id: ClientId, seq: u32, op: Op<u32>) -> ReplicaEvent<u32> {
        Recv(Request {
            client_id,
            client_addr: client_id,
            seq,
            op,
        })
    }

    #[test]
    fn register_assigns_incremental_ids() {
        let mut replica = TestReplica::new(100, Default::default());
        replica
            .on_event(request(7, 1, Op::Register { endpoint: 107 }), &mut NullTimer)
            .unwrap();
        replica
            .on_event(request(8, 1, Op::Register { endpoint: 108 }), &mut NullTimer)
            .unwrap();
        let (_, reply) = &replica.net.0[1];
        let OpOk::Registered {
            node_id,
            initial_balance,
            ref peers,
        } = reply.result
        else {
            panic!("not registered: {reply:?}")
        };
        assert_eq!(node_id, 2);
        assert_eq!(initial_balance, 100);
        assert_eq!(peers, &[(1, 107), (2, 108)])
    }

    #[test]
    fn debit_guards_balance() {
        let mut replica = TestReplica::new(5, Default::default());
        replica
            .on_event(request(7, 1, Op::Register { endpoint: 107 }), &mut NullTimer)
            .unwrap();
        replica
            .on_event(request(7, 2, Op::Debit { node: 1, amount: 10 }), &mut NullTimer)
            .unwrap();
        assert_eq!(replica.net.0[1].1.result, OpOk::Insufficient);
        replica
            .on_event(request(7, 3, Op::Debit { node: 1, amount: 5 }), &mut NullTimer)
            .unwrap();
        assert_eq!(replica.net.0[2].1.result, OpOk::Accepted);
        replica
            .on_event(request(7, 4, Op::Balance { node: 1 }), &mut NullTimer)
            .unwrap();
        assert_eq!(replica.net.0[3].1.result, OpOk::Balance(0))
    }

    #[test]
    fn retransmitted_request_not_reapplied() {
        let mut replica = TestReplica::new(100, Default::default());
        replica
            .on_event(request(7, 1, Op::Register { endpoint: 107 }), &mut NullTimer)
            .unwrap();
        replica
            .on_event(request(7, 2, Op::Debit { node: 1, amount: 30 }), &mut NullTimer)
            .unwrap();
        replica
            .on_event(request(7, 2, Op::Debit { node: 1, amount: 30 }), &mut NullTimer)
            .unwrap();
        // the duplicate was answered from the reply cache
        assert_eq!(replica.net.0.len(), 3);
        assert_eq!(replica.net.0[2].1.result, OpOk::Accepted);
        assert_eq!(replica.accounts[&1], 70);
        // a stale seq is dropped outright
        replica
            .on_event(request(7, 1, Op::Register { endpoint: 107 }), &mut NullTimer)
            .unwrap();
        assert_eq!(replica.net.0.len(), 3)
    }

    #[test]
    fn client_resends_and_upcalls_once() {
        let mut client = Client::<_, _, u32>::new(
            7,
            107,
            1,
            CaptureNet::default(),
            CaptureUpcall::default(),
        );
        client
            .on_event(
                Invoke(Op::Debit { node: 1, amount: 3 }).into(),
                &mut NullTimer,
            )
            .unwrap();
        client
            .on_event(ClientEvent::ResendTimeout, &mut NullTimer)
            .unwrap();
        assert_eq!(client.net.0.len(), 2);
        assert_eq!(client.net.0[0].1.seq, client.net.0[1].1.seq);
        let reply = Reply {
            seq: 1,
            result: OpOk::Accepted,
        };
        client
            .on_event(Recv(reply.clone()).into(), &mut NullTimer)
            .unwrap();
        client.on_event(Recv(reply).into(), &mut NullTimer).unwrap();
        assert_eq!(client.upcall.0, [OpOk::Accepted]);
        // a reply for a superseded seq is ignored
        client
            .on_event(
                Invoke(Op::Balance { node: 1 }).into(),
                &mut NullTimer,
            )
            .unwrap();
        client
            .on_event(
                Recv(Reply {
                    seq: 1,
                    result: OpOk::Accepted,
                })
                .into(),
                &mut NullTimer,
            )
            .unwrap();
        assert_eq!(client.upcall.0.len(), 1)
    }
}
