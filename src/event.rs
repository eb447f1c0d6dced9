use std::{collections::HashSet, time::Duration};

use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    time::sleep,
};

pub trait SendEvent<M> {
    fn send(&mut self, event: M) -> anyhow::Result<()>;
}

impl<N: Into<M>, M> SendEvent<N> for UnboundedSender<M> {
    fn send(&mut self, event: N) -> anyhow::Result<()> {
        UnboundedSender::send(self, event.into()).map_err(|_| anyhow::anyhow!("channel closed"))
    }
}

#[derive(Debug)]
pub struct Void; // for testing

impl<M> SendEvent<M> for Void {
    fn send(&mut self, _: M) -> anyhow::Result<()> {
        Ok(())
    }
}

pub type TimerId = u32;

// one shot timers. a handler that wants a periodic signal re-arms on every
// fire, so at any moment an actor owns at most a handful of armed ids and an
// id never outlives the invocation that is responsible for it
pub trait Timer<M> {
    fn set(&mut self, period: Duration, event: M) -> anyhow::Result<TimerId>;

    fn unset(&mut self, timer_id: TimerId) -> anyhow::Result<()>;
}

// accepts timers and never fires them, for driving state machines directly in
// tests
#[derive(Debug)]
pub struct NullTimer;

impl<M> Timer<M> for NullTimer {
    fn set(&mut self, _: Duration, _: M) -> anyhow::Result<TimerId> {
        Ok(0)
    }

    fn unset(&mut self, _: TimerId) -> anyhow::Result<()> {
        Ok(())
    }
}

pub trait OnEvent<M> {
    fn on_event(&mut self, event: M, timer: &mut dyn Timer<M>) -> anyhow::Result<()>;
}

#[derive(Debug)]
enum Item<M> {
    Event(M),
    Fired(TimerId, M),
}

// owns one actor's event stream. every state mutation goes through `run`,
// which is the serialization point the protocol relies on
#[derive(Debug)]
pub struct Session<M> {
    ingress: UnboundedReceiver<Item<M>>,
    handle: UnboundedSender<Item<M>>,
    armed: HashSet<TimerId>,
    last_timer: TimerId,
}

#[derive(Debug)]
pub struct SessionSender<M>(UnboundedSender<Item<M>>);

impl<M> Clone for SessionSender<M> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<M: Into<N>, N> SendEvent<M> for SessionSender<N> {
    fn send(&mut self, event: M) -> anyhow::Result<()> {
        SendEvent::send(&mut self.0, Item::Event(event.into()))
    }
}

impl<M> Session<M> {
    pub fn new() -> Self {
        let (handle, ingress) = unbounded_channel();
        Self {
            ingress,
            handle,
            armed: Default::default(),
            last_timer: 0,
        }
    }

    pub fn sender(&self) -> SessionSender<M> {
        SessionSender(self.handle.clone())
    }

    pub async fn run(&mut self, state: &mut impl OnEvent<M>) -> anyhow::Result<()>
    where
        M: Send + 'static,
    {
        loop {
            let Some(item) = self.ingress.recv().await else {
                anyhow::bail!("event channel closed")
            };
            let event = match item {
                Item::Event(event) => event,
                Item::Fired(timer_id, event) => {
                    // timers are disarmed here, at delivery, never inside the
                    // sleeping task. a fire that lost the race against
                    // `unset` shows up with an id that is no longer armed and
                    // gets dropped, which is what makes `unset` effective
                    // without any signaling toward the task
                    if !self.armed.remove(&timer_id) {
                        continue;
                    }
                    event
                }
            };
            state.on_event(event, self)?
        }
    }
}

impl<M: Send + 'static> Timer<M> for Session<M> {
    fn set(&mut self, period: Duration, event: M) -> anyhow::Result<TimerId> {
        self.last_timer += 1;
        let timer_id = self.last_timer;
        self.armed.insert(timer_id);
        let handle = self.handle.clone();
        // fire and forget: a disarmed timer's event dies at delivery, and a
        // torn down session simply has no receiver left to miss
        tokio::spawn(async move {
            sleep(period).await;
            let _ = handle.send(Item::Fired(timer_id, event));
        });
        Ok(timer_id)
    }

    fn unset(&mut self, timer_id: TimerId) -> anyhow::Result<()> {
        anyhow::ensure!(self.armed.remove(&timer_id), "timer not armed");
        Ok(())
    }
}
