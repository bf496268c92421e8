//! In-memory transport for exercising the pool and dispatcher without a
//! network.

use crate::{
    config::PoolConfig,
    transport::{CallOptions, Connection, ConnectivityState, Dialer},
};
use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    time::Duration,
};
use std::sync::{Arc, Mutex};
use tonic::{Code, Request, Response, Status, codegen::http::uri::PathAndQuery, metadata::MetadataMap};
use tower::BoxError;

/// A call observed by a [`MockConnection`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub connection: usize,
    pub path: String,
    pub metadata: MetadataMap,
    pub timeout: Option<Duration>,
}

#[derive(Default)]
struct Shared {
    dials: AtomicUsize,
    fail_dials: AtomicBool,
    calls: Mutex<Vec<RecordedCall>>,
    fail_calls: Mutex<Option<Code>>,
    connections: Mutex<Vec<Arc<MockState>>>,
}

/// Counts dials, optionally fails them, and records every call.
#[derive(Clone, Default)]
pub struct MockDialer {
    shared: Arc<Shared>,
    delay: Duration,
}

impl MockDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every dial take `delay`, widening the window for races.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn dials(&self) -> usize {
        self.shared.dials.load(Ordering::SeqCst)
    }

    pub fn fail_dials(&self, fail: bool) {
        self.shared.fail_dials.store(fail, Ordering::SeqCst);
    }

    /// Makes every later call fail with `code` after being recorded.
    pub fn fail_calls(&self, code: Code) {
        *self.shared.fail_calls.lock().unwrap() = Some(code);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.shared.calls.lock().unwrap().clone()
    }

    pub fn timeouts(&self) -> Vec<Option<Duration>> {
        self.calls().into_iter().map(|call| call.timeout).collect()
    }

    /// Forces the state of the `n`th dialed connection.
    pub fn set_state(&self, n: usize, state: ConnectivityState) {
        let connections = self.shared.connections.lock().unwrap();
        connections[n].state.store(state as u8, Ordering::SeqCst);
    }

    pub fn state_of(&self, n: usize) -> ConnectivityState {
        let connections = self.shared.connections.lock().unwrap();
        ConnectivityState::from_u8(connections[n].state.load(Ordering::SeqCst))
    }
}

impl Dialer for MockDialer {
    type Connection = MockConnection;

    async fn dial(&self, _endpoint: &str, _config: &PoolConfig) -> Result<MockConnection, BoxError> {
        let id = self.shared.dials.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.shared.fail_dials.load(Ordering::SeqCst) {
            return Err("connection refused".into());
        }

        let state = Arc::new(MockState {
            state: AtomicU8::new(ConnectivityState::Ready as u8),
        });
        self.shared
            .connections
            .lock()
            .unwrap()
            .push(Arc::clone(&state));

        Ok(MockConnection {
            id,
            state,
            shared: Arc::clone(&self.shared),
        })
    }
}

struct MockState {
    state: AtomicU8,
}

pub struct MockConnection {
    pub id: usize,
    state: Arc<MockState>,
    shared: Arc<Shared>,
}

impl fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConnection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection for MockConnection {
    fn state(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.state.state.load(Ordering::SeqCst))
    }

    fn close(&self) {
        self.state
            .state
            .store(ConnectivityState::Shutdown as u8, Ordering::SeqCst);
    }

    async fn unary<M1, M2>(
        &self,
        path: PathAndQuery,
        request: Request<M1>,
        options: CallOptions,
    ) -> Result<Response<M2>, Status>
    where
        M1: prost::Message + Send + Sync + 'static,
        M2: prost::Message + Default + Send + Sync + 'static,
    {
        if !self.state().is_usable() {
            return Err(Status::unavailable("connection is closed"));
        }

        self.shared.calls.lock().unwrap().push(RecordedCall {
            connection: self.id,
            path: path.as_str().to_owned(),
            metadata: request.metadata().clone(),
            timeout: options.timeout,
        });

        match *self.shared.fail_calls.lock().unwrap() {
            Some(code) => Err(Status::new(code, "injected failure")),
            None => Ok(Response::new(M2::default())),
        }
    }
}
