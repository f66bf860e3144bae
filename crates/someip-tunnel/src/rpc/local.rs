//! In-process SOME/IP runtime.
//!
//! Routes service discovery, requests, responses and notifications between
//! applications created from the same [`LocalRuntime`]. Each application owns
//! a mailbox; its handlers run on the thread blocked in [`Application::start`],
//! which drives a current-thread tokio runtime until [`Application::stop`].
//!
//! Routing tables live in `DashMap`s. No table reference is held while
//! another table (or the same one) is accessed, and dispatch always happens
//! after every reference is dropped.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    ANY_INSTANCE, ANY_METHOD, ANY_SERVICE, Application, AvailabilityHandler, ClientId,
    EventGroupId, EventId, EventType, InstanceId, Message, MessageHandler, MessageType, MethodId,
    RpcError, ServiceId, SessionId, State, StateHandler,
};

type ServiceKey = (ServiceId, InstanceId);

enum Dispatch {
    Message(Arc<Message>),
    Availability {
        service: ServiceId,
        instance: InstanceId,
        available: bool,
    },
}

struct EventEntry {
    groups: BTreeSet<EventGroupId>,
    event_type: EventType,
    /// Last value of a field, replayed to new subscribers.
    last_value: Option<Vec<u8>>,
}

#[derive(Default)]
struct Router {
    next_client: AtomicU16,
    mailboxes: DashMap<ClientId, mpsc::UnboundedSender<Dispatch>>,
    offers: DashMap<ServiceKey, ClientId>,
    requests: DashMap<ServiceKey, HashSet<ClientId>>,
    events: DashMap<(ServiceId, InstanceId, EventId), EventEntry>,
    subscriptions: DashMap<(ServiceId, InstanceId, EventGroupId), HashSet<ClientId>>,
}

impl Router {
    fn allocate_client(&self) -> ClientId {
        loop {
            let id = self.next_client.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 && !self.mailboxes.contains_key(&id) {
                return id;
            }
        }
    }

    fn deliver(&self, client: ClientId, dispatch: Dispatch) -> Result<(), RpcError> {
        let sender = self
            .mailboxes
            .get(&client)
            .map(|mailbox| mailbox.value().clone())
            .ok_or(RpcError::UnknownClient(client))?;
        if sender.send(dispatch).is_err() {
            tracing::debug!(client, "Mailbox closed, dropping dispatch");
        }
        Ok(())
    }

    fn requesters_of(&self, service: ServiceId, instance: InstanceId) -> Vec<ClientId> {
        let mut clients = HashSet::new();
        for key in [
            (service, instance),
            (service, ANY_INSTANCE),
            (ANY_SERVICE, ANY_INSTANCE),
        ] {
            if let Some(set) = self.requests.get(&key) {
                clients.extend(set.iter().copied());
            }
        }
        clients.into_iter().collect()
    }

    fn announce(&self, service: ServiceId, instance: InstanceId, available: bool) {
        for client in self.requesters_of(service, instance) {
            let _ = self.deliver(
                client,
                Dispatch::Availability {
                    service,
                    instance,
                    available,
                },
            );
        }
    }

    fn subscribers_of(
        &self,
        service: ServiceId,
        instance: InstanceId,
        groups: &BTreeSet<EventGroupId>,
    ) -> HashSet<ClientId> {
        let mut clients = HashSet::new();
        for group in groups {
            if let Some(set) = self.subscriptions.get(&(service, instance, *group)) {
                clients.extend(set.iter().copied());
            }
        }
        clients
    }

    /// Drops everything an application registered.
    fn unregister(&self, client: ClientId) {
        self.mailboxes.remove(&client);

        let owned: Vec<ServiceKey> = self
            .offers
            .iter()
            .filter(|entry| *entry.value() == client)
            .map(|entry| *entry.key())
            .collect();
        for (service, instance) in owned {
            self.offers.remove(&(service, instance));
            self.announce(service, instance, false);
        }

        self.requests.iter_mut().for_each(|mut set| {
            set.remove(&client);
        });
        self.subscriptions.iter_mut().for_each(|mut set| {
            set.remove(&client);
        });
    }
}

#[derive(Default)]
struct Handlers {
    state: Option<StateHandler>,
    messages: Vec<(ServiceId, InstanceId, MethodId, MessageHandler)>,
    availability: Vec<(ServiceId, InstanceId, AvailabilityHandler)>,
}

fn matches_id(registered: u16, actual: u16) -> bool {
    registered == 0xFFFF || registered == actual
}

impl Handlers {
    /// Most specific registration wins; earlier registration breaks ties.
    fn message_handler(&self, message: &Message) -> Option<MessageHandler> {
        self.messages
            .iter()
            .filter(|(s, i, m, _)| {
                matches_id(*s, message.service)
                    && matches_id(*i, message.instance)
                    && matches_id(*m, message.method)
            })
            // max_by_key keeps the last maximum, so walk in reverse.
            .rev()
            .max_by_key(|(s, i, m, _)| {
                [*s != ANY_SERVICE, *i != ANY_INSTANCE, *m != ANY_METHOD]
                    .iter()
                    .filter(|exact| **exact)
                    .count()
            })
            .map(|(_, _, _, handler)| Arc::clone(handler))
    }

    fn availability_handlers(
        &self,
        service: ServiceId,
        instance: InstanceId,
    ) -> Vec<AvailabilityHandler> {
        self.availability
            .iter()
            .filter(|(s, i, _)| matches_id(*s, service) && matches_id(*i, instance))
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect()
    }
}

/// Process-local routing manager.
#[derive(Clone, Default)]
pub struct LocalRuntime {
    router: Arc<Router>,
}

impl LocalRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_application(&self, name: impl Into<String>) -> Arc<LocalApplication> {
        let client_id = self.router.allocate_client();
        let (tx, rx) = mpsc::unbounded_channel();
        self.router.mailboxes.insert(client_id, tx);

        let name = name.into();
        tracing::debug!(application = %name, client_id, "Created local application");

        Arc::new(LocalApplication {
            name,
            client_id,
            router: Arc::clone(&self.router),
            mailbox: Mutex::new(Some(rx)),
            handlers: Mutex::new(Handlers::default()),
            shutdown: CancellationToken::new(),
            initialized: AtomicBool::new(false),
            session: AtomicU16::new(0),
        })
    }

    /// Whether some application currently offers the service instance.
    pub fn is_offered(&self, service: ServiceId, instance: InstanceId) -> bool {
        self.router.offers.contains_key(&(service, instance))
    }

    /// Number of clients subscribed to an event group.
    pub fn subscriber_count(
        &self,
        service: ServiceId,
        instance: InstanceId,
        group: EventGroupId,
    ) -> usize {
        self.router
            .subscriptions
            .get(&(service, instance, group))
            .map(|set| set.len())
            .unwrap_or(0)
    }
}

/// An application registered with a [`LocalRuntime`].
pub struct LocalApplication {
    name: String,
    client_id: ClientId,
    router: Arc<Router>,
    mailbox: Mutex<Option<mpsc::UnboundedReceiver<Dispatch>>>,
    handlers: Mutex<Handlers>,
    shutdown: CancellationToken,
    initialized: AtomicBool,
    session: AtomicU16,
}

impl LocalApplication {
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn handlers(&self) -> MutexGuard<'_, Handlers> {
        match self.handlers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(application = %self.name, "Handler table poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    fn next_session(&self) -> SessionId {
        loop {
            let session = self.session.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if session != 0 {
                return session;
            }
        }
    }

    fn ensure_initialized(&self) -> Result<(), RpcError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(RpcError::NotInitialized(self.name.clone()))
        }
    }

    fn report_state(&self, state: State) {
        let handler = self.handlers().state.clone();
        if let Some(handler) = handler {
            handler(state);
        }
    }

    fn dispatch(&self, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Message(message) => {
                let handler = self.handlers().message_handler(&message);
                match handler {
                    Some(handler) => handler(message),
                    None => tracing::trace!(
                        application = %self.name,
                        %message,
                        "No handler for message"
                    ),
                }
            }
            Dispatch::Availability {
                service,
                instance,
                available,
            } => {
                let handlers = self.handlers().availability_handlers(service, instance);
                for handler in handlers {
                    handler(service, instance, available);
                }
            }
        }
    }
}

impl Application for LocalApplication {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self) -> Result<(), RpcError> {
        self.initialized.store(true, Ordering::Release);
        tracing::debug!(application = %self.name, "Initialized");
        Ok(())
    }

    fn start(&self) {
        let Some(mut mailbox) = self.mailbox.lock().ok().and_then(|mut m| m.take()) else {
            tracing::warn!(application = %self.name, "Application already started");
            return;
        };
        if self.shutdown.is_cancelled() {
            tracing::debug!(application = %self.name, "Stopped before start");
            return;
        }

        let runtime = match tokio::runtime::Builder::new_current_thread().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!(application = %self.name, error = %e, "Failed to build dispatch runtime");
                return;
            }
        };

        self.report_state(State::Registered);

        let shutdown = self.shutdown.clone();
        runtime.block_on(async {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    next = mailbox.recv() => match next {
                        Some(dispatch) => self.dispatch(dispatch),
                        None => break,
                    },
                }
            }
        });

        self.report_state(State::Deregistered);
        tracing::debug!(application = %self.name, "Dispatch loop exited");
    }

    fn stop(&self) {
        self.shutdown.cancel();
    }

    fn register_state_handler(&self, handler: StateHandler) {
        self.handlers().state = Some(handler);
    }

    fn register_message_handler(
        &self,
        service: ServiceId,
        instance: InstanceId,
        method: MethodId,
        handler: MessageHandler,
    ) {
        self.handlers()
            .messages
            .push((service, instance, method, handler));
    }

    fn register_availability_handler(
        &self,
        service: ServiceId,
        instance: InstanceId,
        handler: AvailabilityHandler,
    ) {
        self.handlers()
            .availability
            .push((service, instance, handler));
    }

    fn clear_all_handlers(&self) {
        *self.handlers() = Handlers::default();
    }

    fn offer_service(&self, service: ServiceId, instance: InstanceId) -> Result<(), RpcError> {
        self.ensure_initialized()?;
        let previous = self.router.offers.insert((service, instance), self.client_id);
        if let Some(owner) = previous
            && owner != self.client_id
        {
            self.router.offers.insert((service, instance), owner);
            return Err(RpcError::NotOwner { service, instance });
        }
        if previous.is_none() {
            tracing::debug!(application = %self.name, service, instance, "Offering service");
            self.router.announce(service, instance, true);
        }
        Ok(())
    }

    fn stop_offer_service(
        &self,
        service: ServiceId,
        instance: InstanceId,
    ) -> Result<(), RpcError> {
        let removed = self
            .router
            .offers
            .remove_if(&(service, instance), |_, owner| *owner == self.client_id);
        if removed.is_none() {
            return Err(RpcError::ServiceNotOffered { service, instance });
        }
        tracing::debug!(application = %self.name, service, instance, "Stopped offering service");
        self.router.announce(service, instance, false);
        Ok(())
    }

    fn offer_event(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        groups: &BTreeSet<EventGroupId>,
        event_type: EventType,
    ) -> Result<(), RpcError> {
        self.ensure_initialized()?;
        let mut entry = self
            .router
            .events
            .entry((service, instance, event))
            .or_insert_with(|| EventEntry {
                groups: BTreeSet::new(),
                event_type,
                last_value: None,
            });
        entry.groups.extend(groups.iter().copied());
        entry.event_type = event_type;
        Ok(())
    }

    fn request_service(&self, service: ServiceId, instance: InstanceId) -> Result<(), RpcError> {
        self.ensure_initialized()?;
        self.router
            .requests
            .entry((service, instance))
            .or_default()
            .insert(self.client_id);

        let offered: Vec<ServiceKey> = self
            .router
            .offers
            .iter()
            .map(|entry| *entry.key())
            .filter(|(s, i)| matches_id(service, *s) && matches_id(instance, *i))
            .collect();
        for (s, i) in offered {
            self.router.deliver(
                self.client_id,
                Dispatch::Availability {
                    service: s,
                    instance: i,
                    available: true,
                },
            )?;
        }
        Ok(())
    }

    fn release_service(&self, service: ServiceId, instance: InstanceId) -> Result<(), RpcError> {
        if let Some(mut set) = self.router.requests.get_mut(&(service, instance)) {
            set.remove(&self.client_id);
        }
        Ok(())
    }

    fn request_event(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        groups: &BTreeSet<EventGroupId>,
        event_type: EventType,
    ) -> Result<(), RpcError> {
        self.ensure_initialized()?;
        let mut entry = self
            .router
            .events
            .entry((service, instance, event))
            .or_insert_with(|| EventEntry {
                groups: BTreeSet::new(),
                event_type,
                last_value: None,
            });
        entry.groups.extend(groups.iter().copied());
        Ok(())
    }

    fn subscribe(
        &self,
        service: ServiceId,
        instance: InstanceId,
        group: EventGroupId,
    ) -> Result<(), RpcError> {
        self.ensure_initialized()?;
        self.router
            .subscriptions
            .entry((service, instance, group))
            .or_default()
            .insert(self.client_id);

        // Initial events: current field values of the group.
        let initial: Vec<(EventId, Vec<u8>)> = self
            .router
            .events
            .iter()
            .filter(|entry| {
                let (s, i, _) = *entry.key();
                s == service
                    && i == instance
                    && entry.event_type == EventType::Field
                    && entry.groups.contains(&group)
            })
            .filter_map(|entry| {
                let (_, _, event) = *entry.key();
                entry.last_value.clone().map(|value| (event, value))
            })
            .collect();
        for (event, value) in initial {
            self.router.deliver(
                self.client_id,
                Dispatch::Message(Arc::new(Message::notification(
                    service, instance, event, value,
                ))),
            )?;
        }
        Ok(())
    }

    fn unsubscribe(
        &self,
        service: ServiceId,
        instance: InstanceId,
        group: EventGroupId,
    ) -> Result<(), RpcError> {
        if let Some(mut set) = self.router.subscriptions.get_mut(&(service, instance, group)) {
            set.remove(&self.client_id);
        }
        Ok(())
    }

    fn send(&self, mut message: Message) -> Result<(), RpcError> {
        self.ensure_initialized()?;
        match message.message_type {
            MessageType::Request | MessageType::RequestNoReturn => {
                let provider = self
                    .router
                    .offers
                    .get(&(message.service, message.instance))
                    .map(|owner| *owner)
                    .ok_or(RpcError::ServiceNotOffered {
                        service: message.service,
                        instance: message.instance,
                    })?;
                message.client = self.client_id;
                message.session = self.next_session();
                tracing::trace!(application = %self.name, %message, "Routing request");
                self.router
                    .deliver(provider, Dispatch::Message(Arc::new(message)))
            }
            MessageType::Response | MessageType::Error => {
                tracing::trace!(application = %self.name, %message, "Routing response");
                self.router
                    .deliver(message.client, Dispatch::Message(Arc::new(message)))
            }
            other => Err(RpcError::InvalidMessageType(other)),
        }
    }

    fn notify(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        payload: Vec<u8>,
    ) -> Result<(), RpcError> {
        self.ensure_initialized()?;
        let groups = {
            let mut entry = self
                .router
                .events
                .get_mut(&(service, instance, event))
                .ok_or(RpcError::EventNotOffered {
                    service,
                    instance,
                    event,
                })?;
            if entry.event_type == EventType::Field {
                entry.last_value = Some(payload.clone());
            }
            entry.groups.clone()
        };

        let message = Arc::new(Message::notification(service, instance, event, payload));
        for client in self.router.subscribers_of(service, instance, &groups) {
            let _ = self
                .router
                .deliver(client, Dispatch::Message(Arc::clone(&message)));
        }
        Ok(())
    }
}

impl Drop for LocalApplication {
    fn drop(&mut self) {
        self.router.unregister(self.client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::thread;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn running(app: &Arc<LocalApplication>) -> thread::JoinHandle<()> {
        let app = Arc::clone(app);
        thread::spawn(move || app.start())
    }

    #[test]
    fn request_reaches_provider_and_response_returns() {
        let runtime = LocalRuntime::new();
        let service = runtime.create_application("service");
        let client = runtime.create_application("client");
        service.init().unwrap();
        client.init().unwrap();

        let responder = Arc::clone(&service);
        service.register_message_handler(
            0x1000,
            0x1,
            0x1,
            Arc::new(move |request: Arc<Message>| {
                let response = Message::response_to(&request).with_payload(vec![0xBB]);
                responder.send(response).unwrap();
            }),
        );
        service.offer_service(0x1000, 0x1).unwrap();

        let (tx, rx) = std_mpsc::channel();
        client.register_message_handler(
            ANY_SERVICE,
            ANY_INSTANCE,
            ANY_METHOD,
            Arc::new(move |message: Arc<Message>| {
                let _ = tx.send((*message).clone());
            }),
        );

        let service_thread = running(&service);
        let client_thread = running(&client);

        client
            .send(Message::request(0x1000, 0x1, 0x1, vec![0xAA]))
            .unwrap();
        let response = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(response.message_type, MessageType::Response);
        assert_eq!(response.payload, vec![0xBB]);
        assert_eq!(response.client, client.client_id());

        service.stop();
        client.stop();
        service_thread.join().unwrap();
        client_thread.join().unwrap();
    }

    #[test]
    fn request_to_unoffered_service_fails() {
        let runtime = LocalRuntime::new();
        let client = runtime.create_application("client");
        client.init().unwrap();
        assert_eq!(
            client.send(Message::request(0x2000, 0x1, 0x1, Vec::new())),
            Err(RpcError::ServiceNotOffered {
                service: 0x2000,
                instance: 0x1
            })
        );
    }

    #[test]
    fn calls_before_init_are_rejected() {
        let runtime = LocalRuntime::new();
        let app = runtime.create_application("early");
        assert_eq!(
            app.offer_service(0x1000, 0x1),
            Err(RpcError::NotInitialized("early".to_string()))
        );
    }

    #[test]
    fn availability_follows_offer_and_stop_offer() {
        let runtime = LocalRuntime::new();
        let provider = runtime.create_application("provider");
        let consumer = runtime.create_application("consumer");
        provider.init().unwrap();
        consumer.init().unwrap();

        let (tx, rx) = std_mpsc::channel();
        consumer.register_availability_handler(
            ANY_SERVICE,
            ANY_INSTANCE,
            Arc::new(move |s: ServiceId, i: InstanceId, active: bool| {
                let _ = tx.send((s, i, active));
            }),
        );
        consumer.request_service(0x1010, 0x1).unwrap();
        let consumer_thread = running(&consumer);

        provider.offer_service(0x1010, 0x1).unwrap();
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (0x1010, 0x1, true));
        assert!(runtime.is_offered(0x1010, 0x1));

        provider.stop_offer_service(0x1010, 0x1).unwrap();
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (0x1010, 0x1, false));

        consumer.stop();
        consumer_thread.join().unwrap();
    }

    #[test]
    fn second_provider_cannot_take_over_offer() {
        let runtime = LocalRuntime::new();
        let first = runtime.create_application("first");
        let second = runtime.create_application("second");
        first.init().unwrap();
        second.init().unwrap();

        first.offer_service(0x1000, 0x1).unwrap();
        assert_eq!(
            second.offer_service(0x1000, 0x1),
            Err(RpcError::NotOwner {
                service: 0x1000,
                instance: 0x1
            })
        );
        assert_eq!(
            second.stop_offer_service(0x1000, 0x1),
            Err(RpcError::ServiceNotOffered {
                service: 0x1000,
                instance: 0x1
            })
        );
        assert!(runtime.is_offered(0x1000, 0x1));
    }

    #[test]
    fn notifications_reach_subscribers_and_fields_replay() {
        let runtime = LocalRuntime::new();
        let provider = runtime.create_application("sensor");
        let early = runtime.create_application("early");
        let late = runtime.create_application("late");
        for app in [&provider, &early, &late] {
            app.init().unwrap();
        }

        let groups = BTreeSet::from([4]);
        provider
            .offer_event(0x1001, 0x1, 0x8004, &groups, EventType::Field)
            .unwrap();
        provider.offer_service(0x1001, 0x1).unwrap();

        let (early_tx, early_rx) = std_mpsc::channel();
        early.register_message_handler(
            0x1001,
            0x1,
            0x8004,
            Arc::new(move |m: Arc<Message>| {
                let _ = early_tx.send(m.payload.clone());
            }),
        );
        early.subscribe(0x1001, 0x1, 4).unwrap();
        let early_thread = running(&early);

        provider.notify(0x1001, 0x1, 0x8004, vec![1]).unwrap();
        assert_eq!(early_rx.recv_timeout(TIMEOUT).unwrap(), vec![1]);
        assert_eq!(runtime.subscriber_count(0x1001, 0x1, 4), 1);

        let (late_tx, late_rx) = std_mpsc::channel();
        late.register_message_handler(
            ANY_SERVICE,
            ANY_INSTANCE,
            ANY_METHOD,
            Arc::new(move |m: Arc<Message>| {
                let _ = late_tx.send((m.message_type, m.payload.clone()));
            }),
        );
        late.subscribe(0x1001, 0x1, 4).unwrap();
        let late_thread = running(&late);
        assert_eq!(
            late_rx.recv_timeout(TIMEOUT).unwrap(),
            (MessageType::Notification, vec![1])
        );

        early.stop();
        late.stop();
        early_thread.join().unwrap();
        late_thread.join().unwrap();
    }

    #[test]
    fn specific_message_handler_wins_over_wildcard() {
        let mut handlers = Handlers::default();
        let (tx, rx) = std_mpsc::channel();
        let any_tx = tx.clone();
        handlers.messages.push((
            ANY_SERVICE,
            ANY_INSTANCE,
            ANY_METHOD,
            Arc::new(move |_: Arc<Message>| {
                let _ = any_tx.send("any");
            }),
        ));
        handlers.messages.push((
            0x1000,
            0x1,
            0x1,
            Arc::new(move |_: Arc<Message>| {
                let _ = tx.send("exact");
            }),
        ));

        let message = Message::request(0x1000, 0x1, 0x1, Vec::new());
        let handler = handlers.message_handler(&message).unwrap();
        handler(Arc::new(message));
        assert_eq!(rx.try_recv().unwrap(), "exact");

        let other = Message::request(0x2000, 0x1, 0x1, Vec::new());
        let handler = handlers.message_handler(&other).unwrap();
        handler(Arc::new(other));
        assert_eq!(rx.try_recv().unwrap(), "any");
    }

    #[test]
    fn stop_before_start_returns_immediately() {
        let runtime = LocalRuntime::new();
        let app = runtime.create_application("short-lived");
        app.init().unwrap();
        app.stop();
        app.start();
    }

    #[test]
    fn dropping_application_withdraws_offers() {
        let runtime = LocalRuntime::new();
        let app = runtime.create_application("transient");
        app.init().unwrap();
        app.offer_service(0x3000, 0x1).unwrap();
        assert!(runtime.is_offered(0x3000, 0x1));
        drop(app);
        assert!(!runtime.is_offered(0x3000, 0x1));
    }
}
