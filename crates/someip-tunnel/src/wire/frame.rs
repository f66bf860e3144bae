//! Frame types exchanged between tunnel endpoints.
//!
//! One `MessageKind` per frame; each kind reads only the header fields it owns:
//! - **OfferService / FindService**: service, instance, service metadata
//! - **OfferServiceAck / FindServiceAck / Message**: service, instance, method, correlation id, payload
//! - **FindServiceAck** additionally carries `is_active`
//! - **Event**: service, instance, method (the event id), payload

use std::fmt;

use crate::rpc::{EventGroupId, EventId, EventType, InstanceId, MethodId, ServiceId};

/// Maximum number of payload bytes carried by one frame.
pub const PAYLOAD_CAPACITY: usize = 1500;

/// Maximum number of event descriptors in a service offer/find.
pub const MAX_EVENT_DESCRIPTORS: usize = 10;

/// Maximum number of event groups one event can belong to.
pub const MAX_EVENT_GROUPS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("unknown message kind {0}")]
    UnknownKind(u32),

    #[error("unknown event kind {0}")]
    UnknownEventKind(u8),

    #[error("invalid is_active flag {0}")]
    InvalidFlag(u8),

    #[error("service metadata holds {0} events (max {MAX_EVENT_DESCRIPTORS})")]
    TooManyEvents(usize),

    #[error("event {event_id:#06x} lists {count} groups (max {MAX_EVENT_GROUPS})")]
    TooManyGroups { event_id: EventId, count: usize },

    #[error("payload of {len} bytes exceeds capacity of {PAYLOAD_CAPACITY}")]
    PayloadTooLarge { len: usize },
}

/// Discriminant of a frame. Values are fixed by the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    OfferService = 0,
    FindService = 1,
    OfferServiceAck = 2,
    FindServiceAck = 3,
    Message = 4,
    Event = 5,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OfferService => "OFFER_SERVICE",
            Self::FindService => "FIND_SERVICE",
            Self::OfferServiceAck => "OFFER_SERVICE_ACK",
            Self::FindServiceAck => "FIND_SERVICE_ACK",
            Self::Message => "MESSAGE",
            Self::Event => "EVENT",
        }
    }

    /// Kinds answered through the correlation table.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Self::OfferServiceAck | Self::FindServiceAck | Self::Message
        )
    }
}

impl TryFrom<u32> for MessageKind {
    type Error = FrameError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::OfferService),
            1 => Ok(Self::FindService),
            2 => Ok(Self::OfferServiceAck),
            3 => Ok(Self::FindServiceAck),
            4 => Ok(Self::Message),
            5 => Ok(Self::Event),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event flavour carried in service metadata.
///
/// Numeric values match the RPC runtime's event types so they can be passed through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    #[default]
    Event = 0,
    Field = 2,
}

impl TryFrom<u8> for EventKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Event),
            2 => Ok(Self::Field),
            other => Err(FrameError::UnknownEventKind(other)),
        }
    }
}

impl From<EventKind> for EventType {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Event => EventType::Event,
            EventKind::Field => EventType::Field,
        }
    }
}

/// One event of an offered or requested service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventDescriptor {
    event_id: EventId,
    kind: EventKind,
    group_count: u8,
    groups: [EventGroupId; MAX_EVENT_GROUPS],
}

impl EventDescriptor {
    pub fn new(
        event_id: EventId,
        groups: &[EventGroupId],
        kind: EventKind,
    ) -> Result<Self, FrameError> {
        if groups.len() > MAX_EVENT_GROUPS {
            return Err(FrameError::TooManyGroups {
                event_id,
                count: groups.len(),
            });
        }
        let mut stored = [0; MAX_EVENT_GROUPS];
        stored[..groups.len()].copy_from_slice(groups);
        Ok(Self {
            event_id,
            kind,
            group_count: groups.len() as u8,
            groups: stored,
        })
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn groups(&self) -> &[EventGroupId] {
        &self.groups[..self.group_count as usize]
    }
}

/// Bounded list of event descriptors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceMetadata {
    len: u8,
    events: [EventDescriptor; MAX_EVENT_DESCRIPTORS],
}

impl ServiceMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events(events: &[EventDescriptor]) -> Result<Self, FrameError> {
        let mut metadata = Self::new();
        for event in events {
            metadata.push(*event)?;
        }
        Ok(metadata)
    }

    pub fn push(&mut self, event: EventDescriptor) -> Result<(), FrameError> {
        let len = self.len as usize;
        if len == MAX_EVENT_DESCRIPTORS {
            return Err(FrameError::TooManyEvents(len + 1));
        }
        self.events[len] = event;
        self.len += 1;
        Ok(())
    }

    pub fn events(&self) -> &[EventDescriptor] {
        &self.events[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Header transmitted with every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    pub kind: MessageKind,
    pub service_id: ServiceId,
    pub instance_id: InstanceId,
    pub method_id: MethodId,
    /// Zero means no response is expected.
    pub correlation_id: u64,
    pub is_active: bool,
    pub service_metadata: ServiceMetadata,
}

impl WireHeader {
    fn new(kind: MessageKind, service_id: ServiceId, instance_id: InstanceId) -> Self {
        Self {
            kind,
            service_id,
            instance_id,
            method_id: 0,
            correlation_id: 0,
            is_active: false,
            service_metadata: ServiceMetadata::default(),
        }
    }

    pub fn offer_service(
        service_id: ServiceId,
        instance_id: InstanceId,
        metadata: ServiceMetadata,
    ) -> Self {
        Self {
            service_metadata: metadata,
            ..Self::new(MessageKind::OfferService, service_id, instance_id)
        }
    }

    pub fn find_service(
        service_id: ServiceId,
        instance_id: InstanceId,
        metadata: ServiceMetadata,
    ) -> Self {
        Self {
            service_metadata: metadata,
            ..Self::new(MessageKind::FindService, service_id, instance_id)
        }
    }

    pub fn availability(service_id: ServiceId, instance_id: InstanceId, is_active: bool) -> Self {
        Self {
            is_active,
            ..Self::new(MessageKind::FindServiceAck, service_id, instance_id)
        }
    }

    pub fn message(
        service_id: ServiceId,
        instance_id: InstanceId,
        method_id: MethodId,
        correlation_id: u64,
    ) -> Self {
        Self {
            method_id,
            correlation_id,
            ..Self::new(MessageKind::Message, service_id, instance_id)
        }
    }

    pub fn event(service_id: ServiceId, instance_id: InstanceId, event_id: EventId) -> Self {
        Self {
            method_id: event_id,
            ..Self::new(MessageKind::Event, service_id, instance_id)
        }
    }
}

impl fmt::Display for WireHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WireHeader {{ kind: {}, service: {:#06x}, instance: {:#06x}, method: {:#06x}, id: {}",
            self.kind, self.service_id, self.instance_id, self.method_id, self.correlation_id
        )?;
        match self.kind {
            MessageKind::FindServiceAck => write!(f, ", active: {}", self.is_active)?,
            MessageKind::OfferService | MessageKind::FindService => {
                write!(f, ", events: [")?;
                for (i, event) in self.service_metadata.events().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:#06x} {:?} {:?}", event.event_id, event.kind, event.groups())?;
                }
                write!(f, "]")?;
            }
            _ => {}
        }
        write!(f, " }}")
    }
}

/// Bounded payload; bytes beyond `len` are padding.
#[derive(Clone)]
pub struct WirePayload {
    len: u16,
    bytes: [u8; PAYLOAD_CAPACITY],
}

impl WirePayload {
    pub fn empty() -> Self {
        Self {
            len: 0,
            bytes: [0; PAYLOAD_CAPACITY],
        }
    }

    /// Copies `data` into a payload, rejecting anything larger than the capacity.
    pub fn from_slice(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() > PAYLOAD_CAPACITY {
            return Err(FrameError::PayloadTooLarge { len: data.len() });
        }
        let mut payload = Self::empty();
        payload.bytes[..data.len()].copy_from_slice(data);
        payload.len = data.len() as u16;
        Ok(payload)
    }

    pub(crate) fn from_raw(len: u16, bytes: [u8; PAYLOAD_CAPACITY]) -> Self {
        Self { len, bytes }
    }

    pub(crate) fn raw_bytes(&self) -> &[u8; PAYLOAD_CAPACITY] {
        &self.bytes
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for WirePayload {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for WirePayload {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for WirePayload {}

impl fmt::Debug for WirePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WirePayload")
            .field("len", &self.len)
            .field("bytes", &self.as_slice())
            .finish()
    }
}

impl fmt::Display for WirePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WirePayload {{ len: {}, bytes:", self.len)?;
        for byte in self.as_slice() {
            write!(f, " {byte:02x}")?;
        }
        write!(f, " }}")
    }
}

/// A header plus payload unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: WireHeader,
    pub payload: WirePayload,
}

impl Frame {
    pub fn new(header: WireHeader, payload: WirePayload) -> Self {
        Self { header, payload }
    }

    /// A frame with an empty payload.
    pub fn header_only(header: WireHeader) -> Self {
        Self::new(header, WirePayload::empty())
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.header, self.payload)
    }
}
