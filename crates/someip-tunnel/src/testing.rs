//! Test double for [`Application`] that records every call.

use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::rpc::{
    Application, AvailabilityHandler, EventGroupId, EventId, EventType, InstanceId, Message,
    MessageHandler, MethodId, RpcError, ServiceId, State, StateHandler,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Init,
    Stop,
    ClearHandlers,
    OfferService(ServiceId, InstanceId),
    StopOfferService(ServiceId, InstanceId),
    OfferEvent(ServiceId, InstanceId, EventId, Vec<EventGroupId>, EventType),
    RequestService(ServiceId, InstanceId),
    ReleaseService(ServiceId, InstanceId),
    RequestEvent(ServiceId, InstanceId, EventId, Vec<EventGroupId>, EventType),
    Subscribe(ServiceId, InstanceId, EventGroupId),
    Unsubscribe(ServiceId, InstanceId, EventGroupId),
    Send(Message),
    Notify(ServiceId, InstanceId, EventId, Vec<u8>),
}

#[derive(Default)]
struct Handlers {
    state: Option<StateHandler>,
    message: Option<MessageHandler>,
    availability: Option<AvailabilityHandler>,
}

#[derive(Default)]
pub struct RecordingApp {
    calls: Mutex<Vec<Call>>,
    changed: Condvar,
    handlers: Mutex<Handlers>,
    stopped: Mutex<bool>,
    stop_signal: Condvar,
    fail_init: bool,
}

impl RecordingApp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_init() -> Arc<Self> {
        Arc::new(Self {
            fail_init: true,
            ..Self::default()
        })
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
        self.changed.notify_all();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls other than handler bookkeeping and lifecycle.
    pub fn rpc_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| !matches!(call, Call::Init | Call::Stop | Call::ClearHandlers))
            .collect()
    }

    /// Waits until at least `count` RPC calls were recorded.
    pub fn wait_for_rpc_calls(&self, count: usize, timeout: Duration) -> Vec<Call> {
        let deadline = Instant::now() + timeout;
        let mut calls = self.calls.lock().unwrap();
        loop {
            let rpc: Vec<Call> = calls
                .iter()
                .filter(|call| !matches!(call, Call::Init | Call::Stop | Call::ClearHandlers))
                .cloned()
                .collect();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if rpc.len() >= count || remaining.is_zero() {
                return rpc;
            }
            calls = self.changed.wait_timeout(calls, remaining).unwrap().0;
        }
    }

    pub fn has_handlers(&self) -> bool {
        let handlers = self.handlers.lock().unwrap();
        handlers.state.is_some() || handlers.message.is_some() || handlers.availability.is_some()
    }

    /// Delivers `message` to the registered message handler.
    pub fn deliver(&self, message: Message) {
        let handler = self.handlers.lock().unwrap().message.clone();
        if let Some(handler) = handler {
            handler(Arc::new(message));
        }
    }

    pub fn set_available(&self, service: ServiceId, instance: InstanceId, available: bool) {
        let handler = self.handlers.lock().unwrap().availability.clone();
        if let Some(handler) = handler {
            handler(service, instance, available);
        }
    }

    pub fn report_state(&self, state: State) {
        let handler = self.handlers.lock().unwrap().state.clone();
        if let Some(handler) = handler {
            handler(state);
        }
    }
}

impl Application for RecordingApp {
    fn name(&self) -> &str {
        "recording"
    }

    fn init(&self) -> Result<(), RpcError> {
        if self.fail_init {
            return Err(RpcError::NotInitialized("recording".to_string()));
        }
        self.record(Call::Init);
        Ok(())
    }

    fn start(&self) {
        self.report_state(State::Registered);
        let mut stopped = self.stopped.lock().unwrap();
        while !*stopped {
            stopped = self.stop_signal.wait(stopped).unwrap();
        }
    }

    fn stop(&self) {
        self.record(Call::Stop);
        *self.stopped.lock().unwrap() = true;
        self.stop_signal.notify_all();
    }

    fn register_state_handler(&self, handler: StateHandler) {
        self.handlers.lock().unwrap().state = Some(handler);
    }

    fn register_message_handler(
        &self,
        _service: ServiceId,
        _instance: InstanceId,
        _method: MethodId,
        handler: MessageHandler,
    ) {
        self.handlers.lock().unwrap().message = Some(handler);
    }

    fn register_availability_handler(
        &self,
        _service: ServiceId,
        _instance: InstanceId,
        handler: AvailabilityHandler,
    ) {
        self.handlers.lock().unwrap().availability = Some(handler);
    }

    fn clear_all_handlers(&self) {
        *self.handlers.lock().unwrap() = Handlers::default();
        self.record(Call::ClearHandlers);
    }

    fn offer_service(&self, service: ServiceId, instance: InstanceId) -> Result<(), RpcError> {
        self.record(Call::OfferService(service, instance));
        Ok(())
    }

    fn stop_offer_service(
        &self,
        service: ServiceId,
        instance: InstanceId,
    ) -> Result<(), RpcError> {
        self.record(Call::StopOfferService(service, instance));
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
        self.record(Call::OfferEvent(
            service,
            instance,
            event,
            groups.iter().copied().collect(),
            event_type,
        ));
        Ok(())
    }

    fn request_service(&self, service: ServiceId, instance: InstanceId) -> Result<(), RpcError> {
        self.record(Call::RequestService(service, instance));
        Ok(())
    }

    fn release_service(&self, service: ServiceId, instance: InstanceId) -> Result<(), RpcError> {
        self.record(Call::ReleaseService(service, instance));
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
        self.record(Call::RequestEvent(
            service,
            instance,
            event,
            groups.iter().copied().collect(),
            event_type,
        ));
        Ok(())
    }

    fn subscribe(
        &self,
        service: ServiceId,
        instance: InstanceId,
        group: EventGroupId,
    ) -> Result<(), RpcError> {
        self.record(Call::Subscribe(service, instance, group));
        Ok(())
    }

    fn unsubscribe(
        &self,
        service: ServiceId,
        instance: InstanceId,
        group: EventGroupId,
    ) -> Result<(), RpcError> {
        self.record(Call::Unsubscribe(service, instance, group));
        Ok(())
    }

    fn send(&self, message: Message) -> Result<(), RpcError> {
        self.record(Call::Send(message));
        Ok(())
    }

    fn notify(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        payload: Vec<u8>,
    ) -> Result<(), RpcError> {
        self.record(Call::Notify(service, instance, event, payload));
        Ok(())
    }
}
