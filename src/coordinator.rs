use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{
    clock::{LamportClock, LamportTime},
    event::{OnEvent, SendEvent, Timer, TimerId},
    ledger::{self, Ledger, Transaction},
    net::{deserialize, events::Recv, Addr, All, Directory, SendMessage},
    registry::{Invoke, InvokeOk, Op, OpOk},
    NodeId,
};

const RESEND_INTERVAL: Duration = Duration::from_millis(1000);

// attempts after which missing replies are surfaced to the operator. the
// request keeps retrying past this: a stalled section must not be abandoned,
// only reported
const RESEND_WARN_BOUND: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub time: LamportTime,
    pub initiator: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub key: RequestKey,
    pub dst: NodeId,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub in_reply_to: RequestKey,
    pub from: NodeId,
    pub send_ts: LamportTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Committed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub key: RequestKey,
    pub send_ts: LamportTime,
    pub outcome: Outcome,
    // carried verbatim so replicas append the identical block without a
    // separate gossip channel
    pub transaction: Transaction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_more::From)]
pub enum Message {
    Request(Request),
    Reply(Reply),
    Release(Release),
}

impl Message {
    pub fn send_ts(&self) -> LamportTime {
        match self {
            Self::Request(request) => request.key.time,
            Self::Reply(reply) => reply.send_ts,
            Self::Release(release) => release.send_ts,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Origin {
    Local { replies: HashSet<NodeId> },
    Peer,
}

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub key: RequestKey,
    pub origin: Origin,
}

// pending requests in `(time, initiator)` order. the initiator breaks ties,
// so the order is total and identical on every replica
#[derive(Debug, Clone, Default)]
pub struct RequestQueue(Vec<PendingRequest>);

impl RequestQueue {
    pub fn insert(&mut self, request: PendingRequest) -> bool {
        match self
            .0
            .binary_search_by(|other| other.key.cmp(&request.key))
        {
            Ok(_) => false,
            Err(index) => {
                self.0.insert(index, request);
                true
            }
        }
    }

    pub fn remove(&mut self, key: RequestKey) -> Option<PendingRequest> {
        self.0
            .binary_search_by(|other| other.key.cmp(&key))
            .ok()
            .map(|index| self.0.remove(index))
    }

    pub fn get(&self, key: RequestKey) -> Option<&PendingRequest> {
        self.0
            .binary_search_by(|other| other.key.cmp(&key))
            .ok()
            .map(|index| &self.0[index])
    }

    pub fn get_mut(&mut self, key: RequestKey) -> Option<&mut PendingRequest> {
        self.0
            .binary_search_by(|other| other.key.cmp(&key))
            .ok()
            .map(|index| &mut self.0[index])
    }

    pub fn peek_min(&self) -> Option<&PendingRequest> {
        self.0.first()
    }

    pub fn snapshot(&self) -> Vec<RequestKey> {
        self.0.iter().map(|request| request.key).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Transfer {
    pub dst: NodeId,
    pub amount: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Committed,
    Aborted,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct TransferDone {
    pub key: Option<RequestKey>,
    pub dst: NodeId,
    pub amount: u64,
    pub outcome: TransferOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub node_id: NodeId,
    pub clock: LamportTime,
    pub balance: u64,
    pub peers: Vec<NodeId>,
    pub queue: Vec<RequestKey>,
    pub attempts: u32,
    pub ledger_len: u64,
    pub ledger_head: String,
}

#[derive(Debug)]
pub struct Inspect(pub oneshot::Sender<Status>);

#[derive(Debug, derive_more::From)]
pub enum Event<A> {
    Transfer(Transfer),
    Ingress(Recv<Message>),
    Registry(InvokeOk<A>),
    Inspect(Inspect),
    ResendTimeout,
}

pub trait Net: SendMessage<NodeId, Message> + SendMessage<All, Message> {}
impl<T: SendMessage<NodeId, Message> + SendMessage<All, Message>> Net for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Requesting,
    Debiting,
    Crediting,
}

#[derive(Debug)]
struct PendingTransfer {
    key: RequestKey,
    dst: NodeId,
    amount: u64,
    stage: Stage,
    resend_timer: TimerId,
    attempts: u32,
}

#[derive(Debug)]
pub struct Coordinator<N, U, R, A> {
    id: NodeId,
    directory: Directory<A>,
    initial_balance: u64,
    clock: LamportClock,
    queue: RequestQueue,
    // at most one transfer of our own in flight; its queue entry carries the
    // reply accounting
    pending: Option<PendingTransfer>,
    // releases that overtook the release of an earlier section (or their own
    // request), keyed by request. applied strictly in queue order so every
    // replica appends the same sequence
    releases: HashMap<RequestKey, Release>,
    // highest released request time per initiator, to absorb retransmissions
    // arriving after the section they belong to completed
    released: HashMap<NodeId, LamportTime>,
    ledger: Ledger,

    net: N,
    upcall: U,
    registry: R,
}

impl<N, U, R, A: Addr> Coordinator<N, U, R, A> {
    pub fn new(
        id: NodeId,
        directory: Directory<A>,
        initial_balance: u64,
        net: N,
        upcall: U,
        registry: R,
    ) -> Self {
        Self {
            id,
            directory,
            initial_balance,
            net,
            upcall,
            registry,
            clock: LamportClock::new(),
            queue: Default::default(),
            pending: Default::default(),
            releases: Default::default(),
            released: Default::default(),
            ledger: Ledger::new(),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn clock(&self) -> LamportTime {
        self.clock.value()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }
}

impl<N: Net, U: SendEvent<TransferDone>, R: SendEvent<Invoke<A>>, A: Addr> OnEvent<Event<A>>
    for Coordinator<N, U, R, A>
{
    fn on_event(&mut self, event: Event<A>, timer: &mut dyn Timer<Event<A>>) -> anyhow::Result<()> {
        match event {
            Event::Transfer(transfer) => self.on_transfer(transfer, timer),
            Event::Ingress(Recv(message)) => self.on_ingress(message, timer),
            Event::Registry(InvokeOk(result)) => self.on_settle(result, timer),
            Event::Inspect(Inspect(sender)) => self.on_inspect(sender),
            Event::ResendTimeout => self.on_resend_timeout(timer),
        }
    }
}

impl<N: Net, U: SendEvent<TransferDone>, R: SendEvent<Invoke<A>>, A: Addr>
    Coordinator<N, U, R, A>
{
    fn on_transfer(
        &mut self,
        Transfer { dst, amount }: Transfer,
        timer: &mut dyn Timer<Event<A>>,
    ) -> anyhow::Result<()> {
        let rejected = if self.pending.is_some() {
            Some("transfer already in flight")
        } else if amount == 0 {
            Some("zero amount")
        } else if dst == self.id {
            Some("transfer to self")
        } else if self.directory.address(dst).is_err() {
            Some("unknown destination")
        } else {
            None
        };
        if let Some(reason) = rejected {
            warn!("transfer of {amount} to {dst} rejected: {reason}");
            return self.upcall.send(TransferDone {
                key: None,
                dst,
                amount,
                outcome: TransferOutcome::Rejected,
            });
        }
        let time = self.clock.tick_send();
        let key = RequestKey {
            time,
            initiator: self.id,
        };
        let inserted = self.queue.insert(PendingRequest {
            key,
            origin: Origin::Local {
                replies: Default::default(),
            },
        });
        anyhow::ensure!(inserted, "request key reused");
        self.pending = Some(PendingTransfer {
            key,
            dst,
            amount,
            stage: Stage::Requesting,
            resend_timer: timer.set(RESEND_INTERVAL, Event::ResendTimeout)?,
            attempts: 0,
        });
        self.net
            .send(All, Message::from(Request { key, dst, amount }))?;
        // a single node cluster has nobody to wait for
        self.check_granted(timer)
    }

    fn on_ingress(
        &mut self,
        message: Message,
        timer: &mut dyn Timer<Event<A>>,
    ) -> anyhow::Result<()> {
        if !self.validate(&message) {
            warn!("drop malformed message {message:?}");
            return Ok(());
        }
        self.clock.tick_recv(message.send_ts());
        match message {
            Message::Request(request) => self.on_request(request)?,
            Message::Reply(reply) => self.on_reply(reply)?,
            Message::Release(release) => self.on_release(release)?,
        }
        self.advance(timer)
    }

    fn validate(&self, message: &Message) -> bool {
        match message {
            Message::Request(request) => {
                request.key.initiator != 0
                    && request.key.initiator != self.id
                    && request.key.initiator != request.dst
                    && request.amount > 0
                    // the reply goes straight back; a request from outside
                    // the bootstrap membership has nowhere to go
                    && self.directory.address(request.key.initiator).is_ok()
            }
            Message::Reply(reply) => reply.from != 0 && reply.from != self.id,
            Message::Release(release) => {
                release.key.initiator != 0
                    && release.key.initiator != self.id
                    && (release.outcome == Outcome::Aborted || {
                        let transaction = &release.transaction;
                        transaction.initiator == release.key.initiator
                            && transaction.src == transaction.initiator
                            && transaction.ts == release.key.time
                            && transaction.src != transaction.dst
                            && transaction.amount > 0
                    })
            }
        }
    }

    fn on_request(&mut self, request: Request) -> anyhow::Result<()> {
        let initiator = request.key.initiator;
        if self
            .released
            .get(&initiator)
            .is_some_and(|time| request.key.time <= *time)
        {
            // retransmission that overtook its own release; must not be
            // queued again or the ghost entry would block every later grant
            debug!("request {:?} already released", request.key);
        } else if !self.queue.insert(PendingRequest {
            key: request.key,
            origin: Origin::Peer,
        }) {
            debug!("duplicate request {:?}", request.key);
        }
        // replied immediately and unconditionally, also for duplicates (our
        // earlier reply may be the reason for the retransmission). ordering
        // is enforced by the queue, not by withholding replies
        let send_ts = self.clock.tick_send();
        self.net.send(
            initiator,
            Message::from(Reply {
                in_reply_to: request.key,
                from: self.id,
                send_ts,
            }),
        )
    }

    fn on_reply(&mut self, reply: Reply) -> anyhow::Result<()> {
        let Some(pending) = &self.pending else {
            debug!("late reply from {}", reply.from);
            return Ok(());
        };
        if pending.key != reply.in_reply_to {
            debug!("late reply from {} for {:?}", reply.from, reply.in_reply_to);
            return Ok(());
        }
        let Some(entry) = self.queue.get_mut(pending.key) else {
            anyhow::bail!("own request missing from queue")
        };
        let Origin::Local { replies } = &mut entry.origin else {
            anyhow::bail!("own request entry corrupted")
        };
        replies.insert(reply.from);
        Ok(())
    }

    fn on_release(&mut self, release: Release) -> anyhow::Result<()> {
        let initiator = release.key.initiator;
        if self
            .released
            .get(&initiator)
            .is_some_and(|time| release.key.time <= *time)
        {
            debug!("duplicate release {:?}", release.key);
            return Ok(());
        }
        // the release may have overtaken its own request; a stand-in entry
        // keeps the queue discipline intact until it is applied
        self.queue.insert(PendingRequest {
            key: release.key,
            origin: Origin::Peer,
        });
        self.releases.insert(release.key, release);
        Ok(())
    }

    // apply every buffered release that reached the queue head, then
    // re-evaluate our own grant. releases are deterministic on the key order,
    // so applying them head-first keeps the ledgers identical even when the
    // transport reorders them
    fn advance(&mut self, timer: &mut dyn Timer<Event<A>>) -> anyhow::Result<()> {
        loop {
            let Some(key) = self.queue.peek_min().map(|request| request.key) else {
                break;
            };
            let Some(release) = self.releases.remove(&key) else {
                break;
            };
            self.queue.remove(key);
            self.released.insert(key.initiator, key.time);
            if release.outcome == Outcome::Committed {
                self.ledger.append(release.transaction)?;
            }
        }
        self.check_granted(timer)
    }

    fn check_granted(&mut self, timer: &mut dyn Timer<Event<A>>) -> anyhow::Result<()> {
        let Some(pending) = &mut self.pending else {
            return Ok(());
        };
        if pending.stage != Stage::Requesting {
            return Ok(());
        }
        let Some(head) = self.queue.peek_min() else {
            return Ok(());
        };
        if head.key != pending.key {
            return Ok(());
        }
        let Origin::Local { replies } = &head.origin else {
            anyhow::bail!("own request entry corrupted")
        };
        if !self.directory.peers().all(|peer| replies.contains(&peer)) {
            return Ok(());
        }
        // the section is ours until the release goes out. settlement runs
        // against the registry while inbound traffic keeps flowing; exclusion
        // holds because our entry stays queued until then
        timer.unset(pending.resend_timer)?;
        pending.stage = Stage::Debiting;
        debug!("granted {:?}", pending.key);
        let op = Op::Debit {
            node: self.id,
            amount: pending.amount,
        };
        self.registry.send(Invoke(op))
    }

    fn on_settle(
        &mut self,
        result: OpOk<A>,
        timer: &mut dyn Timer<Event<A>>,
    ) -> anyhow::Result<()> {
        let Some(pending) = &mut self.pending else {
            anyhow::bail!("registry result without a transfer")
        };
        match (pending.stage, result) {
            (Stage::Debiting, OpOk::Accepted) => {
                pending.stage = Stage::Crediting;
                let op = Op::Credit {
                    node: pending.dst,
                    amount: pending.amount,
                };
                self.registry.send(Invoke(op))
            }
            (Stage::Debiting, OpOk::Insufficient) => {
                warn!(
                    "transfer of {} to {} aborted: insufficient funds",
                    pending.amount, pending.dst
                );
                self.finish(Outcome::Aborted, timer)
            }
            (Stage::Crediting, OpOk::Accepted) => self.finish(Outcome::Committed, timer),
            (stage, result) => anyhow::bail!("unexpected registry result {result:?} in {stage:?}"),
        }
    }

    fn finish(&mut self, outcome: Outcome, timer: &mut dyn Timer<Event<A>>) -> anyhow::Result<()> {
        let Some(pending) = self.pending.take() else {
            anyhow::bail!("missing transfer")
        };
        let transaction = Transaction {
            src: self.id,
            dst: pending.dst,
            amount: pending.amount,
            ts: pending.key.time,
            initiator: self.id,
        };
        // append before the release is emitted, so the local ledger never
        // lags what peers are about to construct
        if outcome == Outcome::Committed {
            self.ledger.append(transaction)?;
        }
        let removed = self.queue.remove(pending.key);
        anyhow::ensure!(removed.is_some(), "own request missing from queue");
        let send_ts = self.clock.tick_send();
        self.net.send(
            All,
            Message::from(Release {
                key: pending.key,
                send_ts,
                outcome,
                transaction,
            }),
        )?;
        self.upcall.send(TransferDone {
            key: Some(pending.key),
            dst: pending.dst,
            amount: pending.amount,
            outcome: match outcome {
                Outcome::Committed => TransferOutcome::Committed,
                Outcome::Aborted => TransferOutcome::Aborted,
            },
        })?;
        // the head moved: sections queued behind ours may already have their
        // release buffered
        self.advance(timer)
    }

    fn on_resend_timeout(&mut self, timer: &mut dyn Timer<Event<A>>) -> anyhow::Result<()> {
        let Some(pending) = &mut self.pending else {
            // fired while idle: the unset raced with the timeout
            return Ok(());
        };
        if pending.stage != Stage::Requesting {
            return Ok(());
        }
        pending.attempts += 1;
        pending.resend_timer = timer.set(RESEND_INTERVAL, Event::ResendTimeout)?;
        let request = Request {
            key: pending.key,
            dst: pending.dst,
            amount: pending.amount,
        };
        let Some(entry) = self.queue.get(pending.key) else {
            anyhow::bail!("own request missing from queue")
        };
        let Origin::Local { replies } = &entry.origin else {
            anyhow::bail!("own request entry corrupted")
        };
        let missing = self
            .directory
            .peers()
            .filter(|peer| !replies.contains(peer))
            .collect::<Vec<_>>();
        if pending.attempts >= RESEND_WARN_BOUND {
            if missing.is_empty() {
                // fully replied but not at the head: the wait is on an
                // earlier keyed section that has not released yet
                warn!(
                    "request {:?} waiting behind an earlier section after {} attempts",
                    pending.key, pending.attempts
                );
            } else {
                warn!(
                    "request {:?} stalled, no reply from {missing:?} after {} attempts",
                    pending.key, pending.attempts
                );
            }
        }
        for peer in missing {
            // identical retransmission, idempotent at the receiver; the clock
            // does not advance
            self.net.send(peer, Message::from(request.clone()))?
        }
        Ok(())
    }

    fn on_inspect(&mut self, sender: oneshot::Sender<Status>) -> anyhow::Result<()> {
        let status = Status {
            node_id: self.id,
            clock: self.clock.value(),
            balance: self.ledger.balance_of(self.id, self.initial_balance),
            peers: self.directory.peers().collect(),
            queue: self.queue.snapshot(),
            attempts: self
                .pending
                .as_ref()
                .map(|pending| pending.attempts)
                .unwrap_or(0),
            ledger_len: self.ledger.len(),
            ledger_head: ledger::hex(&self.ledger.head().hash),
        };
        // the inspecting side may have given up waiting
        let _ = sender.send(status);
        Ok(())
    }
}

pub fn on_buf(buf: &[u8], sender: &mut impl SendEvent<Recv<Message>>) -> anyhow::Result<()> {
    match deserialize(buf) {
        Ok(message) => sender.send(Recv(message)),
        Err(err) => {
            warn!("malformed message: {err}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn key(time: LamportTime, initiator: NodeId) -> RequestKey {
        RequestKey { time, initiator }
    }

    fn peer(key: RequestKey) -> PendingRequest {
        PendingRequest {
            key,
            origin: Origin::Peer,
        }
    }

    #[test]
    fn initiator_breaks_ties() {
        let mut queue = RequestQueue::default();
        assert!(queue.insert(peer(key(1, 3))));
        assert!(queue.insert(peer(key(1, 1))));
        assert!(queue.insert(peer(key(2, 2))));
        assert_eq!(queue.snapshot(), [key(1, 1), key(1, 3), key(2, 2)]);
        assert_eq!(queue.peek_min().unwrap().key, key(1, 1))
    }

    #[test]
    fn duplicate_insert_rejected() {
        let mut queue = RequestQueue::default();
        assert!(queue.insert(peer(key(1, 1))));
        assert!(!queue.insert(peer(key(1, 1))));
        assert_eq!(queue.snapshot().len(), 1)
    }

    #[test]
    fn remove_absent_is_noop() {
        let mut queue = RequestQueue::default();
        assert!(queue.remove(key(1, 1)).is_none());
        queue.insert(peer(key(1, 1)));
        assert!(queue.remove(key(1, 1)).is_some());
        assert!(queue.remove(key(1, 1)).is_none())
    }

    proptest! {
        #[test]
        fn snapshot_is_sorted(keys in prop::collection::vec((1u64..20, 1u32..5), 0..40)) {
            let mut queue = RequestQueue::default();
            for (time, initiator) in keys {
                queue.insert(peer(key(time, initiator)));
            }
            let snapshot = queue.snapshot();
            let mut sorted = snapshot.clone();
            sorted.sort();
            sorted.dedup();
            prop_assert_eq!(snapshot, sorted)
        }
    }
}
