//! Wire format shared by the two tunnel endpoints.
//!
//! Every frame travels as one fixed-size record over the IPC transport:
//! a self-describing header followed by a bounded payload.
//!
//! # Architecture
//!
//! - **frame**: Frame types (WireHeader, WirePayload, service metadata)
//! - **codec**: Fixed-layout little-endian encoding of frames into records

pub mod codec;
pub mod frame;

pub use codec::{HEADER_SIZE, PAYLOAD_SIZE, RECORD_SIZE, Record, decode, encode};
pub use frame::{
    EventDescriptor, EventKind, Frame, FrameError, MAX_EVENT_DESCRIPTORS, MAX_EVENT_GROUPS,
    MessageKind, PAYLOAD_CAPACITY, ServiceMetadata, WireHeader, WirePayload,
};
