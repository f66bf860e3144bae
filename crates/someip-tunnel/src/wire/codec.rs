//! Fixed-layout record codec.
//!
//! Records are a constant `RECORD_SIZE` bytes regardless of content, all
//! integers little-endian:
//!
//! ```text
//! header (184 bytes)
//!   0   u32  message kind
//!   4   u16  service id
//!   6   u16  instance id
//!   8   u16  method id
//!   10  u8   is_active
//!   11  u8   event descriptor count
//!   12  u32  reserved
//!   16  u64  correlation id
//!   24  10 x event descriptor (16 bytes each)
//!         0  u16     event id
//!         2  u8      group count
//!         3  u8      event kind
//!         4  4 x u16 groups
//!         12 u32     reserved
//! payload (1502 bytes)
//!   184 u16  length
//!   186 [u8; 1500] bytes, zero padded
//! ```

use super::frame::{
    EventDescriptor, EventKind, Frame, FrameError, MAX_EVENT_DESCRIPTORS, MAX_EVENT_GROUPS,
    MessageKind, PAYLOAD_CAPACITY, ServiceMetadata, WireHeader, WirePayload,
};

const DESCRIPTOR_SIZE: usize = 16;
const DESCRIPTORS_OFFSET: usize = 24;

pub const HEADER_SIZE: usize = DESCRIPTORS_OFFSET + MAX_EVENT_DESCRIPTORS * DESCRIPTOR_SIZE;
pub const PAYLOAD_SIZE: usize = 2 + PAYLOAD_CAPACITY;
pub const RECORD_SIZE: usize = HEADER_SIZE + PAYLOAD_SIZE;

/// One transport slot's worth of bytes.
pub type Record = [u8; RECORD_SIZE];

fn put_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// Writes `frame` into `record`, overwriting every byte.
pub fn encode(frame: &Frame, record: &mut Record) {
    record.fill(0);

    let header = &frame.header;
    put_u32(record, 0, header.kind as u32);
    put_u16(record, 4, header.service_id);
    put_u16(record, 6, header.instance_id);
    put_u16(record, 8, header.method_id);
    record[10] = header.is_active as u8;
    record[11] = header.service_metadata.len() as u8;
    put_u64(record, 16, header.correlation_id);

    for (i, event) in header.service_metadata.events().iter().enumerate() {
        let at = DESCRIPTORS_OFFSET + i * DESCRIPTOR_SIZE;
        put_u16(record, at, event.event_id());
        record[at + 2] = event.groups().len() as u8;
        record[at + 3] = event.kind() as u8;
        for (j, group) in event.groups().iter().enumerate() {
            put_u16(record, at + 4 + j * 2, *group);
        }
    }

    let payload = &frame.payload;
    put_u16(record, HEADER_SIZE, payload.len() as u16);
    record[HEADER_SIZE + 2..HEADER_SIZE + 2 + payload.len()].copy_from_slice(payload.as_slice());
}

/// Reads a frame back out of `record`.
///
/// Reserved bytes, unused descriptor slots and payload padding are ignored.
pub fn decode(record: &Record) -> Result<Frame, FrameError> {
    let kind = MessageKind::try_from(get_u32(record, 0))?;

    let is_active = match record[10] {
        0 => false,
        1 => true,
        other => return Err(FrameError::InvalidFlag(other)),
    };

    let event_count = record[11] as usize;
    if event_count > MAX_EVENT_DESCRIPTORS {
        return Err(FrameError::TooManyEvents(event_count));
    }

    let mut service_metadata = ServiceMetadata::new();
    for i in 0..event_count {
        let at = DESCRIPTORS_OFFSET + i * DESCRIPTOR_SIZE;
        let event_id = get_u16(record, at);
        let group_count = record[at + 2] as usize;
        if group_count > MAX_EVENT_GROUPS {
            return Err(FrameError::TooManyGroups {
                event_id,
                count: group_count,
            });
        }
        let event_kind = EventKind::try_from(record[at + 3])?;
        let mut groups = [0u16; MAX_EVENT_GROUPS];
        for (j, group) in groups.iter_mut().enumerate().take(group_count) {
            *group = get_u16(record, at + 4 + j * 2);
        }
        service_metadata.push(EventDescriptor::new(
            event_id,
            &groups[..group_count],
            event_kind,
        )?)?;
    }

    let header = WireHeader {
        kind,
        service_id: get_u16(record, 4),
        instance_id: get_u16(record, 6),
        method_id: get_u16(record, 8),
        correlation_id: get_u64(record, 16),
        is_active,
        service_metadata,
    };

    let len = get_u16(record, HEADER_SIZE);
    if len as usize > PAYLOAD_CAPACITY {
        return Err(FrameError::PayloadTooLarge { len: len as usize });
    }
    let mut bytes = [0u8; PAYLOAD_CAPACITY];
    bytes.copy_from_slice(&record[HEADER_SIZE + 2..]);
    let payload = WirePayload::from_raw(len, bytes);

    Ok(Frame { header, payload })
}
