use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cast::{self, ResolvedCast};
use crate::error::Result;
use crate::handles::HandleDirectory;
use crate::hub::{EventStream, Hub, HubEvent};

pub const INITIAL_FOLLOWS_LIMIT: u32 = 2000;

/// Everything the live feed tells the UI, in hub order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    CastAdded(ResolvedCast),
    FollowAdded(u64),
    FollowRemoved(u64),
    /// Terminal: nothing follows it.
    StreamFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Streaming,
    Closed,
    Failed,
}

pub struct LiveFeedSubscriber {
    hub: Arc<dyn Hub>,
    handles: Option<HandleDirectory>,
    viewer: u64,
}

/// A running subscription. Dropping it asks the reader thread to stop.
pub struct Subscription {
    events: Receiver<FeedEvent>,
    cancel: Arc<AtomicBool>,
    state: Arc<Mutex<StreamState>>,
    worker: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn events(&self) -> &Receiver<FeedEvent> {
        &self.events
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Cancels and waits for the reader to notice.
    pub fn close(mut self) {
        self.cancel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl LiveFeedSubscriber {
    pub fn new(hub: Arc<dyn Hub>, viewer: u64) -> Self {
        Self {
            hub,
            handles: None,
            viewer,
        }
    }

    /// Resolve authors and mentions before casts are handed to the UI.
    pub fn with_handles(mut self, handles: HandleDirectory) -> Self {
        self.handles = Some(handles);
        self
    }

    pub fn initial_follows(&self, limit: u32) -> Result<Vec<u64>> {
        self.hub.following(self.viewer, limit)
    }

    pub fn start(self) -> Result<Subscription> {
        let state = Arc::new(Mutex::new(StreamState::Connecting));
        let stream = self.hub.subscribe()?;
        let (tx, rx) = unbounded();
        let cancel = Arc::new(AtomicBool::new(false));
        let worker = {
            let state = state.clone();
            let cancel = cancel.clone();
            thread::Builder::new()
                .name("lemon3-live".into())
                .spawn(move || {
                    let pump = Pump {
                        viewer: self.viewer,
                        handles: self.handles,
                        tx,
                        cancel,
                        state,
                    };
                    pump.run(stream);
                })
                .map_err(|err| crate::error::Error::local_state("live: spawn reader", err))?
        };
        info!(viewer = self.viewer, "live feed subscribed");
        Ok(Subscription {
            events: rx,
            cancel,
            state,
            worker: Some(worker),
        })
    }
}

struct Pump {
    viewer: u64,
    handles: Option<HandleDirectory>,
    tx: Sender<FeedEvent>,
    cancel: Arc<AtomicBool>,
    state: Arc<Mutex<StreamState>>,
}

impl Pump {
    fn run(self, mut stream: Box<dyn EventStream>) {
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                debug!("live feed cancelled");
                self.set_state(StreamState::Closed);
                return;
            }
            match stream.next_event() {
                Ok(Some(event)) => {
                    self.set_state(StreamState::Streaming);
                    let Some(event) = self.filter(event) else {
                        continue;
                    };
                    if self.tx.send(event).is_err() {
                        self.set_state(StreamState::Closed);
                        return;
                    }
                }
                Ok(None) => {
                    debug!("live feed ended");
                    self.set_state(StreamState::Closed);
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "live feed failed");
                    self.set_state(StreamState::Failed);
                    let _ = self.tx.send(FeedEvent::StreamFailed(err.to_string()));
                    return;
                }
            }
        }
    }

    fn set_state(&self, state: StreamState) {
        *self.state.lock() = state;
    }

    fn filter(&self, event: HubEvent) -> Option<FeedEvent> {
        match event {
            HubEvent::CastAdded(raw) if cast::is_enclosure_post(&raw) => match cast::decode(&raw) {
                Ok(Some(mut cast)) => {
                    if let Some(handles) = &self.handles {
                        handles.warm(&mut cast);
                    }
                    Some(FeedEvent::CastAdded(cast))
                }
                Ok(None) => None,
                Err(err) => {
                    warn!(error = %err, "dropping undecodable live cast");
                    None
                }
            },
            HubEvent::LinkAdded { fid, target_fid } if fid == self.viewer => {
                Some(FeedEvent::FollowAdded(target_fid))
            }
            HubEvent::LinkRemoved { fid, target_fid } if fid == self.viewer => {
                Some(FeedEvent::FollowRemoved(target_fid))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::RawPost;
    use crate::storage::MemoryCache;
    use crate::testing::{FakeHub, Scripted};

    fn raw(hash: &str, embeds: &[&str]) -> RawPost {
        RawPost {
            author_id: 3,
            hash: hash.into(),
            embeds: embeds.iter().map(|e| e.to_string()).collect(),
            ..RawPost::default()
        }
    }

    fn run(script: Vec<Scripted>) -> (Vec<FeedEvent>, StreamState) {
        let hub = Arc::new(FakeHub::default());
        hub.add_user("alice", 3);
        hub.script(script);
        let handles = HandleDirectory::new(hub.clone(), Arc::new(MemoryCache::new()));
        let sub = LiveFeedSubscriber::new(hub, 7)
            .with_handles(handles)
            .start()
            .unwrap();
        let events: Vec<FeedEvent> = sub.events().iter().collect();
        let state = sub.state();
        sub.close();
        (events, state)
    }

    #[test]
    fn forwards_enclosures_and_own_follows_in_order() {
        let (events, state) = run(vec![
            Scripted::Event(HubEvent::Idle),
            Scripted::Event(HubEvent::CastAdded(raw("0x01", &["https://x.y"]))),
            Scripted::Event(HubEvent::LinkAdded { fid: 7, target_fid: 3 }),
            Scripted::Event(HubEvent::CastAdded(raw("0x02", &["lemon3+ipfs://bafy"]))),
            Scripted::Event(HubEvent::LinkAdded { fid: 8, target_fid: 3 }),
            Scripted::Event(HubEvent::LinkRemoved { fid: 7, target_fid: 3 }),
            Scripted::Event(HubEvent::Other),
            Scripted::End,
        ]);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], FeedEvent::FollowAdded(3));
        match &events[1] {
            FeedEvent::CastAdded(cast) => {
                assert_eq!(cast.hash, "0x02");
                assert_eq!(cast.author_handle, "alice");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(events[2], FeedEvent::FollowRemoved(3));
        assert_eq!(state, StreamState::Closed);
    }

    #[test]
    fn read_error_is_terminal() {
        let (events, state) = run(vec![
            Scripted::Event(HubEvent::LinkAdded { fid: 7, target_fid: 1 }),
            Scripted::Fail("connection reset".into()),
            Scripted::Event(HubEvent::LinkAdded { fid: 7, target_fid: 2 }),
        ]);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], FeedEvent::StreamFailed(msg) if msg.contains("connection reset")));
        assert_eq!(state, StreamState::Failed);
    }

    #[test]
    fn clean_end_is_silent() {
        let (events, state) = run(vec![Scripted::End]);
        assert!(events.is_empty());
        assert_eq!(state, StreamState::Closed);
    }

    #[test]
    fn refused_subscription_is_an_error() {
        let hub = Arc::new(FakeHub::default());
        assert!(LiveFeedSubscriber::new(hub, 1).start().is_err());
    }

    #[test]
    fn initial_follows_come_from_the_hub() {
        let hub = Arc::new(FakeHub::default());
        hub.follow(7, 3);
        hub.follow(7, 4);
        let subscriber = LiveFeedSubscriber::new(hub, 7);
        assert_eq!(subscriber.initial_follows(1).unwrap(), vec![3]);
    }
}
