//! Bridge lifecycle.
//!
//! A [`Bridge`] joins one RPC application with one pair of IPC endpoints.
//!
//! # Architecture
//!
//! - **inbound**: RPC callbacks → frames on the publisher (runs on the RPC
//!   runtime's dispatch thread)
//! - **outbound**: frames from the subscriber → RPC calls (runs on the
//!   dedicated poller thread)
//!
//! The two paths share only the publisher and the correlation table, each
//! behind its own mutex.
//!
//! # Lifecycle
//!
//! `Created → Initialized → Running → Stopping → Stopped`. Stopping is
//! ordered: the RPC runtime is stopped and its handlers cleared, the poller
//! is signalled and joined, advertisements made on behalf of the peer are
//! withdrawn, abandoned requests are dropped, then the endpoints are
//! released. A stopped bridge cannot be restarted.

pub mod inbound;
pub mod outbound;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crate::config::{ConfigError, TunnelConfig};
use crate::correlation::CorrelationTable;
use crate::ipc::{IpcError, Publisher, Subscriber, Transport};
use crate::rpc::{
    ANY_INSTANCE, ANY_METHOD, ANY_SERVICE, Application, InstanceId, Message, ReturnCode, RpcError,
    ServiceId, State,
};
use crate::wire::{Frame, encode};

pub use inbound::Inbound;
pub use outbound::{Advertisements, Outbound};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Created,
    Initialized,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("transport setup failed: {0}")]
    Transport(#[from] IpcError),

    #[error("rpc runtime error: {0}")]
    Rpc(#[from] RpcError),

    #[error("invalid tunnel config: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot {operation} bridge in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: BridgeState,
    },

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} thread panicked")]
    Panicked(&'static str),
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(what, "Bridge mutex poisoned - recovering");
            poisoned.into_inner()
        }
    }
}

/// State reachable from both translators.
pub(crate) struct Shared {
    pub(crate) app: Arc<dyn Application>,
    pub(crate) config: TunnelConfig,
    pub(crate) table: CorrelationTable,
    publisher: Mutex<Option<Box<dyn Publisher>>>,
}

impl Shared {
    pub(crate) fn new(app: Arc<dyn Application>, config: TunnelConfig) -> Self {
        Self {
            app,
            config,
            table: CorrelationTable::new(),
            publisher: Mutex::new(None),
        }
    }

    /// Encodes `frame` into a loaned record and sends it.
    pub(crate) fn publish(&self, frame: &Frame) -> Result<(), IpcError> {
        let mut publisher = lock(&self.publisher, "publisher");
        let publisher = publisher.as_mut().ok_or(IpcError::Closed)?;
        encode(frame, publisher.loan()?);
        publisher.send()?;
        tracing::trace!(%frame, "Published frame");
        Ok(())
    }

    /// Answers `request` with an error so its caller is not left waiting.
    pub(crate) fn reply_error(&self, request: &Message, code: ReturnCode) {
        let response = Message::error_response(request, code);
        if let Err(e) = self.app.send(response) {
            tracing::warn!(error = %e, %request, "Failed to send error response");
        }
    }

    fn set_publisher(&self, publisher: Option<Box<dyn Publisher>>) {
        *lock(&self.publisher, "publisher") = publisher;
    }
}

struct BridgeInner {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    state: Mutex<BridgeState>,
    subscriber: Mutex<Option<Box<dyn Subscriber>>>,
    poller: Mutex<Option<JoinHandle<Advertisements>>>,
    shutdown: Arc<AtomicBool>,
}

/// The tunnel between one RPC application and one pair of IPC services.
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    pub fn new(
        app: Arc<dyn Application>,
        transport: Arc<dyn Transport>,
        config: TunnelConfig,
    ) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                shared: Arc::new(Shared::new(app, config)),
                transport,
                state: Mutex::new(BridgeState::Created),
                subscriber: Mutex::new(None),
                poller: Mutex::new(None),
                shutdown: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    pub fn state(&self) -> BridgeState {
        *lock(&self.inner.state, "state")
    }

    /// Number of requests awaiting a response from the peer.
    pub fn pending_requests(&self) -> usize {
        self.inner.shared.table.len()
    }

    /// Initializes the RPC application, opens both endpoints and registers
    /// the inbound handlers.
    pub fn init(&self) -> Result<(), BridgeError> {
        self.inner.init()
    }

    /// Spawns the poller and runs the RPC dispatch loop on the calling thread
    /// until [`Bridge::stop`].
    pub fn start(&self) -> Result<(), BridgeError> {
        self.inner.start()
    }

    pub fn stop(&self) -> Result<(), BridgeError> {
        self.inner.stop()
    }

    /// Like [`Bridge::start`], but the dispatch loop runs on a dedicated
    /// thread. The bridge is already `Running` when this returns.
    pub fn spawn(self) -> Result<RunningBridge, BridgeError> {
        self.inner.begin()?;
        let inner = Arc::clone(&self.inner);
        let dispatcher = thread::Builder::new()
            .name("tunnel-dispatch".to_string())
            .spawn(move || inner.dispatch())
            .map_err(|source| BridgeError::Spawn {
                name: "dispatch",
                source,
            })?;
        Ok(RunningBridge {
            bridge: self,
            dispatcher: Some(dispatcher),
        })
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if matches!(
            self.state(),
            BridgeState::Initialized | BridgeState::Running
        ) && let Err(e) = self.inner.stop()
        {
            tracing::warn!(error = %e, "Failed to stop bridge on drop");
        }
    }
}

impl BridgeInner {
    fn init(&self) -> Result<(), BridgeError> {
        let mut state = lock(&self.state, "state");
        if *state != BridgeState::Created {
            return Err(BridgeError::InvalidState {
                operation: "init",
                state: *state,
            });
        }

        let shared = &self.shared;
        let config = &shared.config;
        config.validate()?;
        shared.app.init()?;

        let publisher = self.transport.open_publisher(&config.to_gateway)?;
        let subscriber = self.transport.open_subscriber(&config.from_gateway)?;
        shared.set_publisher(Some(publisher));
        *lock(&self.subscriber, "subscriber") = Some(subscriber);

        let inbound = Arc::new(Inbound::new(Arc::clone(shared)));
        {
            let inbound = Arc::clone(&inbound);
            shared
                .app
                .register_state_handler(Arc::new(move |state: State| inbound.on_state(state)));
        }
        {
            let inbound = Arc::clone(&inbound);
            shared.app.register_message_handler(
                ANY_SERVICE,
                ANY_INSTANCE,
                ANY_METHOD,
                Arc::new(move |message: Arc<Message>| inbound.on_message(message)),
            );
        }
        shared.app.register_availability_handler(
            ANY_SERVICE,
            ANY_INSTANCE,
            Arc::new(move |service: ServiceId, instance: InstanceId, available: bool| {
                inbound.on_availability(service, instance, available)
            }),
        );

        *state = BridgeState::Initialized;
        tracing::info!(
            app = %config.app_name,
            publish = %config.to_gateway.name,
            subscribe = %config.from_gateway.name,
            "Tunnel initialized"
        );
        Ok(())
    }

    fn start(&self) -> Result<(), BridgeError> {
        self.begin()?;
        self.dispatch();
        Ok(())
    }

    /// Moves `Initialized → Running` and spawns the poller under the state
    /// lock.
    fn begin(&self) -> Result<(), BridgeError> {
        let mut state = lock(&self.state, "state");
        if *state != BridgeState::Initialized {
            return Err(BridgeError::InvalidState {
                operation: "start",
                state: *state,
            });
        }
        let subscriber = lock(&self.subscriber, "subscriber")
            .take()
            .ok_or(IpcError::Closed)?;
        let outbound = Outbound::new(Arc::clone(&self.shared));
        let shutdown = Arc::clone(&self.shutdown);
        let poller = thread::Builder::new()
            .name("tunnel-poller".to_string())
            .spawn(move || outbound.run(subscriber, &shutdown))
            .map_err(|source| BridgeError::Spawn {
                name: "poller",
                source,
            })?;
        *lock(&self.poller, "poller") = Some(poller);
        *state = BridgeState::Running;
        tracing::info!(app = %self.shared.config.app_name, "Tunnel running");
        Ok(())
    }

    /// Blocks in the RPC dispatch loop until the application is stopped.
    fn dispatch(&self) {
        self.shared.app.start();
        tracing::debug!("RPC dispatch loop returned");
    }

    fn stop(&self) -> Result<(), BridgeError> {
        {
            let mut state = lock(&self.state, "state");
            match *state {
                BridgeState::Created => {
                    *state = BridgeState::Stopped;
                    return Ok(());
                }
                BridgeState::Stopping | BridgeState::Stopped => return Ok(()),
                BridgeState::Initialized | BridgeState::Running => {
                    *state = BridgeState::Stopping;
                }
            }
        }
        tracing::info!(app = %self.shared.config.app_name, "Stopping tunnel");

        let app = &self.shared.app;
        app.stop();
        app.clear_all_handlers();

        self.shutdown.store(true, Ordering::Release);
        let poller = lock(&self.poller, "poller").take();
        let mut result = Ok(());
        let advertisements = match poller {
            Some(handle) => match handle.join() {
                Ok(advertisements) => advertisements,
                Err(_) => {
                    tracing::error!("Poller thread panicked");
                    result = Err(BridgeError::Panicked("poller"));
                    Advertisements::default()
                }
            },
            None => Advertisements::default(),
        };
        advertisements.withdraw(app.as_ref());

        for (id, request) in self.shared.table.drain() {
            tracing::warn!(id = %format_args!("{id:#018x}"), %request, "Dropping unanswered request");
            self.shared.reply_error(&request, ReturnCode::NotReady);
        }

        self.shared.set_publisher(None);
        lock(&self.subscriber, "subscriber").take();

        *lock(&self.state, "state") = BridgeState::Stopped;
        tracing::info!(app = %self.shared.config.app_name, "Tunnel stopped");
        result
    }
}

/// A bridge whose dispatch loop runs on its own thread.
pub struct RunningBridge {
    bridge: Bridge,
    dispatcher: Option<JoinHandle<()>>,
}

impl RunningBridge {
    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// Stops the bridge and waits for its dispatch thread.
    pub fn stop(mut self) -> Result<(), BridgeError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), BridgeError> {
        let stopped = self.bridge.stop();
        let Some(dispatcher) = self.dispatcher.take() else {
            return stopped;
        };
        dispatcher
            .join()
            .map_err(|_| BridgeError::Panicked("dispatch"))?;
        stopped
    }
}

impl Drop for RunningBridge {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "Failed to stop running bridge");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::memory::MemoryTransport;
    use crate::ipc::{IpcError, ServiceConfig};
    use crate::rpc::MessageType;
    use crate::testing::{Call, RecordingApp};
    use crate::wire::{
        EventDescriptor, EventKind, MessageKind, RECORD_SIZE, ServiceMetadata, WireHeader,
        WirePayload, decode,
    };
    use std::time::{Duration, Instant};

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// The peer's view: publishes on the bridge's inbox, reads its outbox.
    struct Peer {
        publisher: Box<dyn Publisher>,
        subscriber: Box<dyn Subscriber>,
    }

    impl Peer {
        fn attach(transport: &MemoryTransport, config: &TunnelConfig) -> Self {
            Self {
                publisher: transport.open_publisher(&config.from_gateway).unwrap(),
                subscriber: transport.open_subscriber(&config.to_gateway).unwrap(),
            }
        }

        fn send(&mut self, frame: &Frame) {
            encode(frame, self.publisher.loan().unwrap());
            self.publisher.send().unwrap();
        }

        fn send_raw(&mut self, edit: impl FnOnce(&mut [u8; RECORD_SIZE])) {
            edit(self.publisher.loan().unwrap());
            self.publisher.send().unwrap();
        }

        fn recv(&mut self) -> Frame {
            let deadline = Instant::now() + TIMEOUT;
            loop {
                if let Some(record) = self.subscriber.receive().unwrap() {
                    return decode(&record).unwrap();
                }
                assert!(Instant::now() < deadline, "no frame from bridge");
                self.subscriber.wait(Duration::from_millis(20)).unwrap();
            }
        }

        fn try_recv(&mut self) -> Option<Frame> {
            self.subscriber
                .receive()
                .unwrap()
                .map(|record| decode(&record).unwrap())
        }
    }

    fn config() -> TunnelConfig {
        TunnelConfig::default().with_cycle_time(Duration::from_millis(10))
    }

    fn running(
        config: TunnelConfig,
    ) -> (Arc<RecordingApp>, MemoryTransport, Peer, RunningBridge) {
        let app = RecordingApp::new();
        let transport = MemoryTransport::new();
        let peer = Peer::attach(&transport, &config);
        let bridge = Bridge::new(app.clone(), Arc::new(transport.clone()), config);
        bridge.init().unwrap();
        let running = bridge.spawn().unwrap();
        (app, transport, peer, running)
    }

    fn request(client: u16, session: u16, payload: Vec<u8>) -> Message {
        let mut message = Message::request(0x1000, 0x1, 0x1, payload);
        message.client = client;
        message.session = session;
        message
    }

    #[test]
    fn request_response_round_trip() {
        let (app, _transport, mut peer, running) = running(config());

        app.deliver(request(0x10, 1, vec![0xAA]));
        let frame = peer.recv();
        assert_eq!(frame.header.kind, MessageKind::Message);
        assert_eq!(
            (frame.header.service_id, frame.header.instance_id, frame.header.method_id),
            (0x1000, 0x1, 0x1)
        );
        assert_ne!(frame.header.correlation_id, 0);
        assert_eq!(frame.payload.as_slice(), &[0xAA]);
        assert_eq!(running.bridge().pending_requests(), 1);

        peer.send(&Frame::new(
            WireHeader::message(0x1000, 0x1, 0x1, frame.header.correlation_id),
            WirePayload::from_slice(&[0xBB]).unwrap(),
        ));
        let calls = app.wait_for_rpc_calls(1, TIMEOUT);
        let Call::Send(response) = &calls[0] else {
            panic!("expected a response, got {calls:?}");
        };
        assert_eq!(response.message_type, MessageType::Response);
        assert_eq!(response.client, 0x10);
        assert_eq!(response.session, 1);
        assert_eq!(response.payload, vec![0xBB]);
        assert_eq!(running.bridge().pending_requests(), 0);

        running.stop().unwrap();
    }

    #[test]
    fn unknown_correlation_is_dropped() {
        let (app, _transport, mut peer, running) = running(config());
        peer.send(&Frame::new(
            WireHeader::message(0x1000, 0x1, 0x1, 0xDEAD),
            WirePayload::from_slice(&[1]).unwrap(),
        ));
        peer.send(&Frame::header_only(WireHeader::availability(0x1000, 0x1, true)));
        // A later frame proves the earlier ones were consumed.
        peer.send(&Frame::header_only(WireHeader::offer_service(
            0x2000,
            0x1,
            ServiceMetadata::new(),
        )));
        assert_eq!(
            app.wait_for_rpc_calls(1, TIMEOUT),
            vec![Call::OfferService(0x2000, 0x1)]
        );
        running.stop().unwrap();
    }

    #[test]
    fn service_discovery_offers_events_before_service() {
        let (app, _transport, mut peer, running) = running(config());
        let event = EventDescriptor::new(0x8015, &[15], EventKind::Field).unwrap();
        peer.send(&Frame::header_only(WireHeader::offer_service(
            0x1010,
            0x1,
            ServiceMetadata::from_events(&[event]).unwrap(),
        )));

        let calls = app.wait_for_rpc_calls(2, TIMEOUT);
        assert_eq!(
            calls,
            vec![
                Call::OfferEvent(0x1010, 0x1, 0x8015, vec![15], crate::rpc::EventType::Field),
                Call::OfferService(0x1010, 0x1),
            ]
        );

        running.stop().unwrap();
        assert!(
            app.calls()
                .contains(&Call::StopOfferService(0x1010, 0x1))
        );
    }

    #[test]
    fn availability_is_relayed() {
        let (app, _transport, mut peer, running) = running(config());
        app.set_available(0x1010, 0x1, true);
        let frame = peer.recv();
        assert_eq!(frame.header.kind, MessageKind::FindServiceAck);
        assert_eq!((frame.header.service_id, frame.header.instance_id), (0x1010, 0x1));
        assert!(frame.header.is_active);
        assert_eq!(frame.header.correlation_id, 0);
        running.stop().unwrap();
    }

    #[test]
    fn events_are_notified() {
        let (app, _transport, mut peer, running) = running(config());
        peer.send(&Frame::new(
            WireHeader::event(0x1001, 0x1, 0x8004),
            WirePayload::from_slice(&[1, 0]).unwrap(),
        ));
        assert_eq!(
            app.wait_for_rpc_calls(1, TIMEOUT),
            vec![Call::Notify(0x1001, 0x1, 0x8004, vec![1, 0])]
        );
        running.stop().unwrap();
    }

    #[test]
    fn queued_frames_are_drained_in_order() {
        let config = config();
        let app = RecordingApp::new();
        let transport = MemoryTransport::new();
        let mut peer = Peer::attach(&transport, &config);
        let bridge = Bridge::new(app.clone(), Arc::new(transport.clone()), config);
        bridge.init().unwrap();

        for event in 0..10u16 {
            peer.send(&Frame::new(
                WireHeader::event(0x1001, 0x1, 0x8000 + event),
                WirePayload::from_slice(&[event as u8]).unwrap(),
            ));
        }
        let running = bridge.spawn().unwrap();
        let calls = app.wait_for_rpc_calls(10, TIMEOUT);
        let expected: Vec<Call> = (0..10u16)
            .map(|event| Call::Notify(0x1001, 0x1, 0x8000 + event, vec![event as u8]))
            .collect();
        assert_eq!(calls, expected);
        running.stop().unwrap();
    }

    #[test]
    fn unknown_kind_causes_no_rpc_call() {
        let (app, _transport, mut peer, running) = running(config());
        peer.send_raw(|record| record[0..4].copy_from_slice(&42u32.to_le_bytes()));
        peer.send(&Frame::new(
            WireHeader::event(0x1001, 0x1, 0x8004),
            WirePayload::from_slice(&[7]).unwrap(),
        ));
        assert_eq!(
            app.wait_for_rpc_calls(1, TIMEOUT),
            vec![Call::Notify(0x1001, 0x1, 0x8004, vec![7])]
        );
        running.stop().unwrap();
    }

    #[test]
    fn oversize_request_gets_error_response() {
        let (app, _transport, mut peer, running) = running(config());
        app.deliver(request(0x10, 2, vec![0; 1501]));

        let calls = app.wait_for_rpc_calls(1, TIMEOUT);
        let Call::Send(error) = &calls[0] else {
            panic!("expected an error response, got {calls:?}");
        };
        assert_eq!(error.message_type, MessageType::Error);
        assert_eq!(error.return_code, ReturnCode::MalformedMessage);
        assert_eq!(running.bridge().pending_requests(), 0);
        assert!(peer.try_recv().is_none());
        running.stop().unwrap();
    }

    #[test]
    fn notifications_become_event_frames() {
        let (app, _transport, mut peer, running) = running(config());
        app.deliver(Message::notification(0x1001, 0x1, 0x8004, vec![0x01]));
        let frame = peer.recv();
        assert_eq!(frame.header.kind, MessageKind::Event);
        assert_eq!(frame.header.method_id, 0x8004);
        assert_eq!(frame.header.correlation_id, 0);
        assert_eq!(frame.payload.as_slice(), &[0x01]);
        running.stop().unwrap();
    }

    #[test]
    fn expired_requests_are_swept() {
        let config = config().with_request_ttl(Some(Duration::from_millis(20)));
        let (app, _transport, mut peer, running) = running(config);
        app.deliver(request(0x10, 3, vec![1]));
        let _ = peer.recv();

        let deadline = Instant::now() + TIMEOUT;
        while running.bridge().pending_requests() > 0 {
            assert!(Instant::now() < deadline, "request never expired");
            std::thread::sleep(Duration::from_millis(10));
        }
        running.stop().unwrap();
    }

    #[test]
    fn stop_releases_everything() {
        let (app, _transport, mut peer, running) = running(config());
        app.report_state(State::Registered);
        app.deliver(request(0x10, 4, vec![1]));
        let _ = peer.recv();

        let event = EventDescriptor::new(0x8004, &[4], EventKind::Event).unwrap();
        peer.send(&Frame::header_only(WireHeader::find_service(
            0x1001,
            0x1,
            ServiceMetadata::from_events(&[event]).unwrap(),
        )));
        app.wait_for_rpc_calls(3, TIMEOUT);

        running.stop().unwrap();
        assert!(!app.has_handlers());
        let calls = app.calls();
        let abandoned = calls
            .iter()
            .find_map(|call| match call {
                Call::Send(reply) if reply.session == 4 => Some(reply),
                _ => None,
            })
            .expect("abandoned request was not answered");
        assert_eq!(abandoned.message_type, MessageType::Error);
        assert_eq!(abandoned.return_code, ReturnCode::NotReady);
        assert!(calls.contains(&Call::Unsubscribe(0x1001, 0x1, 4)));
        assert!(calls.contains(&Call::ReleaseService(0x1001, 0x1)));
        let stop_at = calls.iter().position(|c| *c == Call::Stop).unwrap();
        let clear_at = calls.iter().position(|c| *c == Call::ClearHandlers).unwrap();
        let withdraw_at = calls
            .iter()
            .position(|c| matches!(c, Call::Unsubscribe(..)))
            .unwrap();
        assert!(stop_at < clear_at && clear_at < withdraw_at);
    }

    #[test]
    fn spawn_then_immediate_stop_succeeds() {
        for _ in 0..50 {
            let app = RecordingApp::new();
            let bridge = Bridge::new(app.clone(), Arc::new(MemoryTransport::new()), config());
            bridge.init().unwrap();
            let running = bridge.spawn().unwrap();
            assert_eq!(running.bridge().state(), BridgeState::Running);
            running.stop().unwrap();
            assert!(app.calls().contains(&Call::Stop));
        }
    }

    #[test]
    fn lifecycle_state_errors() {
        let app = RecordingApp::new();
        let bridge = Bridge::new(
            app,
            Arc::new(MemoryTransport::new()),
            config(),
        );
        assert!(matches!(
            bridge.start(),
            Err(BridgeError::InvalidState {
                operation: "start",
                state: BridgeState::Created
            })
        ));

        bridge.init().unwrap();
        assert_eq!(bridge.state(), BridgeState::Initialized);
        assert!(matches!(
            bridge.init(),
            Err(BridgeError::InvalidState { operation: "init", .. })
        ));

        bridge.stop().unwrap();
        assert_eq!(bridge.state(), BridgeState::Stopped);
        bridge.stop().unwrap();
        assert!(matches!(
            bridge.init(),
            Err(BridgeError::InvalidState {
                state: BridgeState::Stopped,
                ..
            })
        ));
        assert!(matches!(
            bridge.start(),
            Err(BridgeError::InvalidState {
                state: BridgeState::Stopped,
                ..
            })
        ));
    }

    #[test]
    fn init_failures_leave_bridge_created() {
        let bridge = Bridge::new(
            RecordingApp::failing_init(),
            Arc::new(MemoryTransport::new()),
            config(),
        );
        assert!(matches!(bridge.init(), Err(BridgeError::Rpc(_))));
        assert_eq!(bridge.state(), BridgeState::Created);

        let busy = config().with_cycle_time(Duration::ZERO);
        let bridge = Bridge::new(RecordingApp::new(), Arc::new(MemoryTransport::new()), busy);
        assert!(matches!(
            bridge.init(),
            Err(BridgeError::Config(ConfigError::ZeroCycleTime))
        ));
        assert_eq!(bridge.state(), BridgeState::Created);

        let bad = config().with_to_gateway(ServiceConfig::new(""));
        let bridge = Bridge::new(RecordingApp::new(), Arc::new(MemoryTransport::new()), bad);
        assert!(matches!(
            bridge.init(),
            Err(BridgeError::Transport(IpcError::InvalidConfig { .. }))
        ));
    }

    #[test]
    fn end_to_end_through_local_runtime() {
        use crate::rpc::local::LocalRuntime;
        use std::sync::mpsc;

        let runtime = LocalRuntime::new();
        let tunnel_app = runtime.create_application("Tunnel");
        let client = runtime.create_application("client");
        let config = config();
        let transport = MemoryTransport::new();
        let mut peer = Peer::attach(&transport, &config);
        let bridge = Bridge::new(tunnel_app, Arc::new(transport.clone()), config);
        bridge.init().unwrap();
        let running = bridge.spawn().unwrap();

        peer.send(&Frame::header_only(WireHeader::offer_service(
            0x1000,
            0x1,
            ServiceMetadata::new(),
        )));
        let deadline = Instant::now() + TIMEOUT;
        while !runtime.is_offered(0x1000, 0x1) {
            assert!(Instant::now() < deadline, "service never offered");
            std::thread::sleep(Duration::from_millis(5));
        }

        client.init().unwrap();
        let (tx, rx) = mpsc::channel();
        client.register_message_handler(
            0x1000,
            0x1,
            0x1,
            Arc::new(move |message: Arc<Message>| {
                let _ = tx.send(message.payload.clone());
            }),
        );
        let client_thread = {
            let client = Arc::clone(&client);
            std::thread::spawn(move || client.start())
        };

        client
            .send(Message::request(0x1000, 0x1, 0x1, vec![0xAA]))
            .unwrap();
        let frame = peer.recv();
        assert_eq!(frame.payload.as_slice(), &[0xAA]);
        peer.send(&Frame::new(
            WireHeader::message(0x1000, 0x1, 0x1, frame.header.correlation_id),
            WirePayload::from_slice(&[0xBB]).unwrap(),
        ));
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), vec![0xBB]);

        running.stop().unwrap();
        assert!(!runtime.is_offered(0x1000, 0x1));
        client.stop();
        client_thread.join().unwrap();
    }

    #[test]
    fn dropping_initialized_bridge_clears_handlers() {
        let app = RecordingApp::new();
        let bridge = Bridge::new(app.clone(), Arc::new(MemoryTransport::new()), config());
        bridge.init().unwrap();
        assert!(app.has_handlers());
        drop(bridge);
        assert!(!app.has_handlers());
    }
}
