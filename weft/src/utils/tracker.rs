#![allow(unused)]

use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Method {
    PushLocal,
    PushGlobal,
    Overflow,
    PollGlobal,
    Steal,
    Spawn,
    Wake,
    Notify,
    Park,
    Shutdown,
}

const METHODS: [Method; 10] = [
    Method::PushLocal,
    Method::PushGlobal,
    Method::Overflow,
    Method::PollGlobal,
    Method::Steal,
    Method::Spawn,
    Method::Wake,
    Method::Notify,
    Method::Park,
    Method::Shutdown,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    PushLocal { len: usize },
    PushGlobal { len: usize },
    Overflow { len: usize },
    PollGlobal { slot: usize },
    Steal { from: usize, count: usize },
    Spawn { slot: usize, inline: bool },
    Wake { slot: usize },
    Notify,
    Park { slot: usize },
    Shutdown,
}

/// Records every scheduling decision the pool makes while under test.
/// Cloned handles share storage, so a test can grab one from inside the
/// entry task and inspect it after the pool is gone. No-op call sites in
/// release builds.
#[derive(Debug, Clone)]
pub(crate) struct Tracker {
    calls: Arc<DashMap<Method, Vec<Call>>>,
}

impl Tracker {
    pub(crate) fn new() -> Self {
        let map = DashMap::new();
        for method in METHODS {
            map.insert(method, Vec::new());
        }
        Self {
            calls: Arc::new(map),
        }
    }

    pub(crate) fn record(&self, method: Method, call: Call) {
        self.calls
            .get_mut(&method)
            .expect("method not found")
            .push(call);
    }

    pub(crate) fn get_calls(&self, method: &Method) -> Vec<Call> {
        self.calls
            .get(method)
            .expect("method not found")
            .value()
            .clone()
    }

    pub(crate) fn num_calls(&self, method: &Method) -> usize {
        self.calls.get(method).map_or(0, |calls| calls.len())
    }
}
