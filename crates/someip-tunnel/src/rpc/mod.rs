//! RPC-side API surface consumed by the tunnel.
//!
//! The tunnel never talks to a SOME/IP stack directly. It registers callbacks
//! with, and issues calls against, an [`Application`]: offer/request services
//! and events, subscribe, send requests and responses, notify.
//!
//! [`local::LocalRuntime`] provides an in-process implementation that routes
//! between applications living in the same process.

pub mod local;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

pub type ServiceId = u16;
pub type InstanceId = u16;
pub type MethodId = u16;
pub type EventId = u16;
pub type EventGroupId = u16;
pub type ClientId = u16;
pub type SessionId = u16;

pub const ANY_SERVICE: ServiceId = 0xFFFF;
pub const ANY_INSTANCE: InstanceId = 0xFFFF;
pub const ANY_METHOD: MethodId = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Request,
    /// Fire-and-forget request, no response is sent.
    RequestNoReturn,
    Notification,
    Response,
    Error,
}

impl MessageType {
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request | Self::RequestNoReturn)
    }

    pub fn expects_response(&self) -> bool {
        matches!(self, Self::Request)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ReturnCode {
    #[default]
    Ok,
    NotOk,
    UnknownService,
    UnknownMethod,
    NotReady,
    MalformedMessage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum EventType {
    #[default]
    Event,
    SelectiveEvent,
    Field,
}

/// Registration state reported to the state handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Registered,
    Deregistered,
}

/// A SOME/IP message as seen by applications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub service: ServiceId,
    pub instance: InstanceId,
    pub method: MethodId,
    pub client: ClientId,
    pub session: SessionId,
    pub message_type: MessageType,
    pub return_code: ReturnCode,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn request(
        service: ServiceId,
        instance: InstanceId,
        method: MethodId,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            service,
            instance,
            method,
            client: 0,
            session: 0,
            message_type: MessageType::Request,
            return_code: ReturnCode::Ok,
            payload: payload.into(),
        }
    }

    pub fn request_no_return(
        service: ServiceId,
        instance: InstanceId,
        method: MethodId,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            message_type: MessageType::RequestNoReturn,
            ..Self::request(service, instance, method, payload)
        }
    }

    pub fn notification(
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            message_type: MessageType::Notification,
            ..Self::request(service, instance, event, payload)
        }
    }

    /// Builds an empty response addressed back to the sender of `request`.
    pub fn response_to(request: &Message) -> Self {
        Self {
            service: request.service,
            instance: request.instance,
            method: request.method,
            client: request.client,
            session: request.session,
            message_type: MessageType::Response,
            return_code: ReturnCode::Ok,
            payload: Vec::new(),
        }
    }

    pub fn error_response(request: &Message, return_code: ReturnCode) -> Self {
        Self {
            message_type: MessageType::Error,
            return_code,
            ..Self::response_to(request)
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:04x}.{:04x}.{:04x}] client {:04x} session {:04x} {:?} ({} bytes)",
            self.service,
            self.instance,
            self.method,
            self.client,
            self.session,
            self.message_type,
            self.payload.len()
        )
    }
}

pub type StateHandler = Arc<dyn Fn(State) + Send + Sync>;
pub type MessageHandler = Arc<dyn Fn(Arc<Message>) + Send + Sync>;
pub type AvailabilityHandler = Arc<dyn Fn(ServiceId, InstanceId, bool) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("application {0} is not initialized")]
    NotInitialized(String),

    #[error("service {service:#06x}.{instance:#06x} is not offered")]
    ServiceNotOffered {
        service: ServiceId,
        instance: InstanceId,
    },

    #[error("service {service:#06x}.{instance:#06x} is offered by another application")]
    NotOwner {
        service: ServiceId,
        instance: InstanceId,
    },

    #[error("event {event:#06x} of service {service:#06x}.{instance:#06x} is not offered")]
    EventNotOffered {
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
    },

    #[error("no application with client id {0:#06x}")]
    UnknownClient(ClientId),

    #[error("cannot send message of type {0:?}")]
    InvalidMessageType(MessageType),
}

/// The SOME/IP application API the tunnel is written against.
///
/// Implementations must be callable from any thread; handlers are invoked
/// from the thread blocked in [`Application::start`].
pub trait Application: Send + Sync {
    fn name(&self) -> &str;

    fn init(&self) -> Result<(), RpcError>;

    /// Runs the dispatch loop until [`Application::stop`] is called.
    fn start(&self);

    fn stop(&self);

    fn register_state_handler(&self, handler: StateHandler);

    fn register_message_handler(
        &self,
        service: ServiceId,
        instance: InstanceId,
        method: MethodId,
        handler: MessageHandler,
    );

    fn register_availability_handler(
        &self,
        service: ServiceId,
        instance: InstanceId,
        handler: AvailabilityHandler,
    );

    fn clear_all_handlers(&self);

    fn offer_service(&self, service: ServiceId, instance: InstanceId) -> Result<(), RpcError>;

    fn stop_offer_service(&self, service: ServiceId, instance: InstanceId)
    -> Result<(), RpcError>;

    fn offer_event(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        groups: &BTreeSet<EventGroupId>,
        event_type: EventType,
    ) -> Result<(), RpcError>;

    fn request_service(&self, service: ServiceId, instance: InstanceId) -> Result<(), RpcError>;

    fn release_service(&self, service: ServiceId, instance: InstanceId) -> Result<(), RpcError>;

    fn request_event(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        groups: &BTreeSet<EventGroupId>,
        event_type: EventType,
    ) -> Result<(), RpcError>;

    fn subscribe(
        &self,
        service: ServiceId,
        instance: InstanceId,
        group: EventGroupId,
    ) -> Result<(), RpcError>;

    fn unsubscribe(
        &self,
        service: ServiceId,
        instance: InstanceId,
        group: EventGroupId,
    ) -> Result<(), RpcError>;

    /// Sends a request or a response.
    fn send(&self, message: Message) -> Result<(), RpcError>;

    fn notify(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        payload: Vec<u8>,
    ) -> Result<(), RpcError>;
}
