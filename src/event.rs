use std::{collections::HashMap, fmt::Debug, time::Duration};

use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    task::{AbortHandle, JoinError, JoinSet},
    time::interval,
};

pub trait SendEvent<M> {
    fn send(&mut self, event: M) -> anyhow::Result<()>;
}

impl<T: ?Sized + SendEvent<M>, M> SendEvent<M> for Box<T> {
    fn send(&mut self, event: M) -> anyhow::Result<()> {
        T::send(self, event)
    }
}

#[derive(Debug)]
pub struct Void; // for testing and for call sites that discard emitted events

impl<M> SendEvent<M> for Void {
    fn send(&mut self, _: M) -> anyhow::Result<()> {
        Ok(())
    }
}

// non-Copy so that `unset` consumes the id and a dead timer cannot be
// referred anymore. leak is still possible, hence Clone stays permitted
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct TimerId(u32);

pub trait Timer<M> {
    fn set_dyn(
        &mut self,
        period: Duration,
        event: Box<dyn FnMut() -> M + Send>,
    ) -> anyhow::Result<TimerId>;

    fn set(
        &mut self,
        period: Duration,
        event: impl FnMut() -> M + Send + 'static,
    ) -> anyhow::Result<TimerId>
    where
        Self: Sized,
    {
        self.set_dyn(period, Box::new(event))
    }

    fn unset(&mut self, timer_id: TimerId) -> anyhow::Result<()>;
}

pub trait OnEvent<M> {
    fn on_event(&mut self, event: M, timer: &mut impl Timer<M>) -> anyhow::Result<()>;
}

#[derive(Debug)]
enum SessionEvent<M> {
    Timer(TimerId, M),
    Other(M),
}

#[derive(Debug)]
pub struct Sender<M>(UnboundedSender<SessionEvent<M>>);

impl<M> Clone for Sender<M> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<M: Into<N>, N> SendEvent<M> for Sender<N> {
    fn send(&mut self, event: M) -> anyhow::Result<()> {
        self.0
            .send(SessionEvent::Other(event.into()))
            .map_err(|_| anyhow::format_err!("channel closed"))
    }
}

pub struct Session<M> {
    sender: UnboundedSender<SessionEvent<M>>,
    receiver: UnboundedReceiver<SessionEvent<M>>,
    timer_id: u32,
    timer_sessions: JoinSet<anyhow::Result<()>>,
    timer_handles: HashMap<TimerId, AbortHandle>,
}

impl<M> Debug for Session<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("timer_id", &self.timer_id)
            .field("timers", &self.timer_handles)
            .finish_non_exhaustive()
    }
}

impl<M> Session<M> {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded_channel();
        Self {
            sender,
            receiver,
            timer_id: 0,
            timer_sessions: JoinSet::new(),
            timer_handles: Default::default(),
        }
    }

    pub fn sender(&self) -> Sender<M> {
        Sender(self.sender.clone())
    }
}

impl<M> Default for Session<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Send + 'static> Session<M> {
    pub async fn run(&mut self, state: &mut impl OnEvent<M>) -> anyhow::Result<()> {
        loop {
            enum Select<M> {
                JoinNext(Result<anyhow::Result<()>, JoinError>),
                Recv(Option<SessionEvent<M>>),
            }
            let event = match tokio::select! {
                Some(result) = self.timer_sessions.join_next() => Select::JoinNext(result),
                recv = self.receiver.recv() => Select::Recv(recv)
            } {
                Select::JoinNext(Err(err)) if err.is_cancelled() => continue,
                Select::JoinNext(result) => {
                    result??;
                    continue;
                }
                Select::Recv(event) => event.ok_or(anyhow::format_err!("channel closed"))?,
            };
            let event = match event {
                SessionEvent::Timer(timer_id, event) => {
                    // a stalled timer event may survive its `unset`, skip it
                    if self.timer_handles.contains_key(&timer_id) {
                        event
                    } else {
                        continue;
                    }
                }
                SessionEvent::Other(event) => event,
            };
            state.on_event(event, self)?
        }
    }
}

impl<M: Send + 'static> Timer<M> for Session<M> {
    fn set_dyn(
        &mut self,
        period: Duration,
        mut event: Box<dyn FnMut() -> M + Send>,
    ) -> anyhow::Result<TimerId> {
        self.timer_id += 1;
        let timer_id = TimerId(self.timer_id);
        let sender = self.sender.clone();
        let handle = self.timer_sessions.spawn({
            let timer_id = timer_id.clone();
            async move {
                let mut interval = interval(period);
                interval.tick().await; // the immediate tick
                loop {
                    interval.tick().await;
                    sender
                        .send(SessionEvent::Timer(timer_id.clone(), event()))
                        .map_err(|_| anyhow::format_err!("channel closed"))?
                }
            }
        });
        self.timer_handles.insert(timer_id.clone(), handle);
        Ok(timer_id)
    }

    fn unset(&mut self, timer_id: TimerId) -> anyhow::Result<()> {
        self.timer_handles
            .remove(&timer_id)
            .ok_or(anyhow::format_err!("timer not exists"))?
            .abort();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(u32, Option<TimerId>);

    #[derive(Debug)]
    struct Tick;

    impl OnEvent<Tick> for Counter {
        fn on_event(&mut self, Tick: Tick, timer: &mut impl Timer<Tick>) -> anyhow::Result<()> {
            self.0 += 1;
            if self.0 == 3 {
                timer.unset(self.1.take().ok_or(anyhow::format_err!("no timer"))?)?;
                anyhow::bail!("done")
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_timer_fires_until_unset() -> anyhow::Result<()> {
        let mut session = Session::new();
        let timer_id = session.set(Duration::from_millis(10), || Tick)?;
        let mut state = Counter(0, Some(timer_id));
        let result = session.run(&mut state).await;
        assert!(result.is_err());
        assert_eq!(state.0, 3);
        Ok(())
    }

    #[tokio::test]
    async fn sender_delivers_in_order() -> anyhow::Result<()> {
        #[derive(Debug)]
        struct Push(u32);
        struct Collect(Vec<u32>);
        impl OnEvent<Push> for Collect {
            fn on_event(&mut self, Push(n): Push, _: &mut impl Timer<Push>) -> anyhow::Result<()> {
                self.0.push(n);
                if self.0.len() == 3 {
                    anyhow::bail!("done")
                }
                Ok(())
            }
        }
        let mut session = Session::new();
        let mut sender = session.sender();
        for n in 0..3 {
            sender.send(Push(n))?
        }
        let mut state = Collect(Default::default());
        let _ = session.run(&mut state).await;
        assert_eq!(state.0, vec![0, 1, 2]);
        Ok(())
    }
}
