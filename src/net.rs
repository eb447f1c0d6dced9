use std::{collections::BTreeMap, fmt::Debug, hash::Hash, marker::PhantomData, sync::Arc};

use bincode::Options;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::NodeId;

pub mod session;

pub trait Addr:
    Debug + Clone + Eq + Hash + Send + Sync + Serialize + DeserializeOwned + 'static
{
}
impl<T: Debug + Clone + Eq + Hash + Send + Sync + Serialize + DeserializeOwned + 'static> Addr
    for T
{
}

pub trait Buf: AsRef<[u8]> + Clone + Send + Sync + 'static {}
impl<T: AsRef<[u8]> + Clone + Send + Sync + 'static> Buf for T {}

// broadcast destination: every known peer except the local node
#[derive(Debug, Clone, Copy)]
pub struct All;

pub trait SendMessage<A, M> {
    fn send(&mut self, dest: A, message: M) -> anyhow::Result<()>;
}

pub mod events {
    #[derive(Debug, Clone)]
    pub struct Recv<M>(pub M);
}

pub fn serialize<M: Serialize>(message: &M) -> anyhow::Result<Bytes> {
    Ok(bincode::options().serialize(message)?.into())
}

pub fn deserialize<M: DeserializeOwned>(buf: &[u8]) -> anyhow::Result<M> {
    Ok(bincode::options().deserialize(buf)?)
}

// typed messages in front of a raw buffer transport
#[derive(Debug, Clone)]
pub struct MessageNet<N, M>(pub N, PhantomData<M>);

impl<N, M> MessageNet<N, M> {
    pub fn new(net: N) -> Self {
        Self(net, Default::default())
    }
}

impl<N: SendMessage<A, Bytes>, A, M: Serialize, M0: Into<M>> SendMessage<A, M0>
    for MessageNet<N, M>
{
    fn send(&mut self, dest: A, message: M0) -> anyhow::Result<()> {
        self.0.send(dest, serialize(&message.into())?)
    }
}

// the peer directory. immutable after bootstrap; every coordinator operation
// that would contact a node missing from here fails instead of silently
// narrowing the reply quorum
#[derive(Debug)]
pub struct Directory<A> {
    id: NodeId,
    entries: Arc<BTreeMap<NodeId, A>>,
}

impl<A> Clone for Directory<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            entries: self.entries.clone(),
        }
    }
}

impl<A: Addr> Directory<A> {
    pub fn new(id: NodeId, entries: BTreeMap<NodeId, A>) -> anyhow::Result<Self> {
        anyhow::ensure!(entries.contains_key(&id), "own endpoint not in directory");
        Ok(Self {
            id,
            entries: entries.into(),
        })
    }

    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.keys().copied().filter(|id| *id != self.id)
    }

    pub fn address(&self, id: NodeId) -> anyhow::Result<A> {
        self.entries
            .get(&id)
            .cloned()
            .ok_or(anyhow::anyhow!("unreachable peer {id}"))
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryNet<N, A> {
    directory: Directory<A>,
    net: N,
}

impl<N, A> DirectoryNet<N, A> {
    pub fn new(directory: Directory<A>, net: N) -> Self {
        Self { directory, net }
    }
}

impl<N: SendMessage<A, B>, A: Addr, B> SendMessage<NodeId, B> for DirectoryNet<N, A> {
    fn send(&mut self, dest: NodeId, buf: B) -> anyhow::Result<()> {
        let addr = self.directory.address(dest)?;
        self.net.send(addr, buf)
    }
}

impl<N: SendMessage<A, B>, A: Addr, B: Buf> SendMessage<All, B> for DirectoryNet<N, A> {
    fn send(&mut self, All: All, buf: B) -> anyhow::Result<()> {
        for id in self.directory.peers() {
            let addr = self.directory.address(id)?;
            self.net.send(addr, buf.clone())?
        }
        Ok(())
    }
}
