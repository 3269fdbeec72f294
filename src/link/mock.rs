//! In-memory link
//!
//! Records every call made through the [`Link`] trait and can be told to fail
//! selected operations. Clones share the same recording, so a test can keep a
//! handle while the bridge owns another.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{Link, LinkError, LinkState};

/// A recorded call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    Connect,
    Subscribe(String),
    Publish { topic: String, payload: Bytes },
    Disconnect { force: bool },
    Reconnect,
}

#[derive(Debug, Default)]
struct Failures {
    connect: Option<LinkError>,
    publish: Option<LinkError>,
    disconnect: Option<LinkError>,
    reconnect: Option<LinkError>,
}

#[derive(Debug, Default)]
struct MockInner {
    state: LinkState,
    calls: Vec<LinkCall>,
    failures: Failures,
}

/// Recording link double
#[derive(Debug, Clone)]
pub struct MockLink {
    name: String,
    inner: Arc<Mutex<MockInner>>,
}

impl MockLink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(Mutex::new(MockInner::default())),
        }
    }

    pub fn set_state(&self, state: LinkState) {
        self.inner.lock().state = state;
    }

    /// Make every subsequent `connect` fail with `error`
    pub fn fail_connect(&self, error: LinkError) {
        self.inner.lock().failures.connect = Some(error);
    }

    /// Make every subsequent `publish` fail with `error`
    pub fn fail_publish(&self, error: LinkError) {
        self.inner.lock().failures.publish = Some(error);
    }

    /// Make every subsequent `disconnect` fail with `error`
    pub fn fail_disconnect(&self, error: LinkError) {
        self.inner.lock().failures.disconnect = Some(error);
    }

    /// Make every subsequent `reconnect` fail with `error`
    pub fn fail_reconnect(&self, error: LinkError) {
        self.inner.lock().failures.reconnect = Some(error);
    }

    /// All calls so far, in order
    pub fn calls(&self) -> Vec<LinkCall> {
        self.inner.lock().calls.clone()
    }

    /// Forget recorded calls
    pub fn clear(&self) {
        self.inner.lock().calls.clear();
    }

    /// Topic and payload of every publish
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                LinkCall::Publish { topic, payload } => Some((topic.clone(), payload.clone())),
                _ => None,
            })
            .collect()
    }

    /// Every subscribed filter
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                LinkCall::Subscribe(filter) => Some(filter.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of recorded calls equal to `call`
    pub fn count(&self, call: &LinkCall) -> usize {
        self.inner.lock().calls.iter().filter(|c| *c == call).count()
    }

    fn record(&self, call: LinkCall) {
        self.inner.lock().calls.push(call);
    }
}

#[async_trait]
impl Link for MockLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> LinkState {
        self.inner.lock().state
    }

    async fn connect(&self) -> Result<(), LinkError> {
        let mut inner = self.inner.lock();
        inner.calls.push(LinkCall::Connect);
        match inner.failures.connect.clone() {
            Some(error) => Err(error),
            None => {
                inner.state = LinkState::Connecting;
                Ok(())
            }
        }
    }

    async fn subscribe(&self, filter: &str) -> Result<(), LinkError> {
        self.record(LinkCall::Subscribe(filter.to_string()));
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), LinkError> {
        let mut inner = self.inner.lock();
        inner.calls.push(LinkCall::Publish {
            topic: topic.to_string(),
            payload,
        });
        match inner.failures.publish.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn disconnect(&self, force: bool) -> Result<(), LinkError> {
        let mut inner = self.inner.lock();
        inner.calls.push(LinkCall::Disconnect { force });
        match inner.failures.disconnect.clone() {
            Some(error) => Err(error),
            None => {
                inner.state = LinkState::Disconnected;
                Ok(())
            }
        }
    }

    async fn reconnect(&self) -> Result<(), LinkError> {
        let mut inner = self.inner.lock();
        inner.calls.push(LinkCall::Reconnect);
        match inner.failures.reconnect.clone() {
            Some(error) => Err(error),
            None => {
                if inner.state != LinkState::Connected {
                    inner.state = LinkState::Connecting;
                }
                Ok(())
            }
        }
    }
}
