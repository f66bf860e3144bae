//! IPC → RPC translation, run by the poller thread.
//!
//! The poller blocks on the subscriber for at most one cycle, drains every
//! queued record, then checks the shutdown flag. Malformed frames and failed
//! RPC calls are logged and skipped; nothing here is fatal.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::Shared;
use crate::correlation::NO_CORRELATION;
use crate::ipc::Subscriber;
use crate::rpc::{
    Application, EventGroupId, EventType, InstanceId, Message, ReturnCode, ServiceId,
};
use crate::wire::{EventDescriptor, Frame, MessageKind, Record, decode};

/// Services and subscriptions the poller set up on behalf of the peer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Advertisements {
    pub offered: BTreeSet<(ServiceId, InstanceId)>,
    pub requested: BTreeSet<(ServiceId, InstanceId)>,
    pub subscriptions: BTreeSet<(ServiceId, InstanceId, EventGroupId)>,
}

impl Advertisements {
    pub fn is_empty(&self) -> bool {
        self.offered.is_empty() && self.requested.is_empty() && self.subscriptions.is_empty()
    }

    /// Undoes every recorded advertisement. Failures are logged.
    pub fn withdraw(self, app: &dyn Application) {
        for (service, instance, group) in self.subscriptions {
            if let Err(e) = app.unsubscribe(service, instance, group) {
                tracing::warn!(error = %e, "Failed to unsubscribe");
            }
        }
        for (service, instance) in self.requested {
            if let Err(e) = app.release_service(service, instance) {
                tracing::warn!(error = %e, "Failed to release service");
            }
        }
        for (service, instance) in self.offered {
            if let Err(e) = app.stop_offer_service(service, instance) {
                tracing::warn!(error = %e, "Failed to stop offering service");
            }
        }
    }
}

fn group_set(event: &EventDescriptor) -> BTreeSet<EventGroupId> {
    event.groups().iter().copied().collect()
}

pub struct Outbound {
    shared: Arc<Shared>,
    advertisements: Advertisements,
}

impl Outbound {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            advertisements: Advertisements::default(),
        }
    }

    /// Polls `subscriber` until `shutdown` is set, then hands back what was
    /// advertised so the caller can withdraw it.
    pub fn run(
        mut self,
        mut subscriber: Box<dyn Subscriber>,
        shutdown: &AtomicBool,
    ) -> Advertisements {
        let cycle = self.shared.config.cycle_time();
        let ttl = self.shared.config.request_ttl();
        tracing::debug!(cycle_ms = cycle.as_millis() as u64, "Poller started");

        while !shutdown.load(Ordering::Acquire) {
            if let Err(e) = subscriber.wait(cycle) {
                tracing::error!(error = %e, "Subscriber wait failed");
                std::thread::sleep(cycle);
                continue;
            }
            self.drain(subscriber.as_mut());
            if let Some(ttl) = ttl {
                self.sweep_expired(ttl);
            }
        }

        tracing::debug!("Poller stopped");
        self.advertisements
    }

    /// Handles every record currently queued. Returns how many were read.
    pub fn drain(&mut self, subscriber: &mut dyn Subscriber) -> usize {
        let mut count = 0;
        loop {
            match subscriber.receive() {
                Ok(Some(record)) => {
                    count += 1;
                    self.handle_record(&record);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Subscriber receive failed");
                    break;
                }
            }
        }
        count
    }

    pub fn handle_record(&mut self, record: &Record) {
        match decode(record) {
            Ok(frame) => self.handle_frame(frame),
            Err(e) => tracing::warn!(error = %e, "Dropping undecodable frame"),
        }
    }

    pub fn handle_frame(&mut self, frame: Frame) {
        tracing::trace!(%frame, "Received frame");
        match frame.header.kind {
            MessageKind::OfferService => self.offer_service(&frame),
            MessageKind::FindService => self.find_service(&frame),
            MessageKind::OfferServiceAck | MessageKind::FindServiceAck | MessageKind::Message => {
                self.respond(&frame)
            }
            MessageKind::Event => self.notify(frame),
        }
    }

    fn offer_service(&mut self, frame: &Frame) {
        let app = self.shared.app.as_ref();
        let header = &frame.header;
        let (service, instance) = (header.service_id, header.instance_id);

        for event in header.service_metadata.events() {
            if let Err(e) = app.offer_event(
                service,
                instance,
                event.event_id(),
                &group_set(event),
                EventType::from(event.kind()),
            ) {
                tracing::warn!(error = %e, "Failed to offer event");
            }
        }
        match app.offer_service(service, instance) {
            Ok(()) => {
                tracing::info!(
                    service = %format_args!("{service:#06x}"),
                    instance = %format_args!("{instance:#06x}"),
                    events = header.service_metadata.len(),
                    "Offering service for peer"
                );
                self.advertisements.offered.insert((service, instance));
            }
            Err(e) => tracing::warn!(error = %e, "Failed to offer service"),
        }
    }

    fn find_service(&mut self, frame: &Frame) {
        let app = self.shared.app.as_ref();
        let header = &frame.header;
        let (service, instance) = (header.service_id, header.instance_id);

        for event in header.service_metadata.events() {
            if let Err(e) = app.request_event(
                service,
                instance,
                event.event_id(),
                &group_set(event),
                EventType::from(event.kind()),
            ) {
                tracing::warn!(error = %e, "Failed to request event");
                continue;
            }
            let Some(&group) = event.groups().first() else {
                continue;
            };
            match app.subscribe(service, instance, group) {
                Ok(()) => {
                    self.advertisements
                        .subscriptions
                        .insert((service, instance, group));
                }
                Err(e) => tracing::warn!(error = %e, group, "Failed to subscribe"),
            }
        }
        match app.request_service(service, instance) {
            Ok(()) => {
                tracing::info!(
                    service = %format_args!("{service:#06x}"),
                    instance = %format_args!("{instance:#06x}"),
                    "Requesting service for peer"
                );
                self.advertisements.requested.insert((service, instance));
            }
            Err(e) => tracing::warn!(error = %e, "Failed to request service"),
        }
    }

    fn respond(&self, frame: &Frame) {
        let id = frame.header.correlation_id;
        let Some(request) = self.shared.table.take(id) else {
            if id == NO_CORRELATION {
                tracing::debug!(%frame, "Frame carries no correlation, dropping");
            } else {
                tracing::warn!(id = %format_args!("{id:#018x}"), kind = %frame.header.kind, "No pending request, dropping");
            }
            return;
        };

        let response = Message::response_to(&request).with_payload(frame.payload.as_slice());
        if let Err(e) = self.shared.app.send(response) {
            tracing::warn!(error = %e, %request, "Failed to send response");
        }
    }

    fn notify(&self, frame: Frame) {
        let header = &frame.header;
        if let Err(e) = self.shared.app.notify(
            header.service_id,
            header.instance_id,
            header.method_id,
            frame.payload.as_slice().to_vec(),
        ) {
            tracing::warn!(error = %e, "Failed to notify event");
        }
    }

    /// Fails pending requests older than `ttl` back to their callers.
    pub fn sweep_expired(&self, ttl: std::time::Duration) {
        for (id, request) in self.shared.table.sweep_expired(ttl) {
            tracing::warn!(
                id = %format_args!("{id:#018x}"),
                %request,
                ttl_ms = ttl.as_millis() as u64,
                "Request expired without response"
            );
            self.shared.reply_error(&request, ReturnCode::NotReady);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelConfig;
    use crate::ipc::Transport;
    use crate::ipc::memory::MemoryTransport;
    use crate::rpc::MessageType;
    use crate::testing::{Call, RecordingApp};
    use std::time::Duration;
    use crate::wire::{
        EventKind, RECORD_SIZE, ServiceMetadata, WireHeader, WirePayload, encode,
    };

    fn outbound() -> (Arc<RecordingApp>, Outbound) {
        let app = RecordingApp::new();
        let shared = Arc::new(Shared::new(app.clone(), TunnelConfig::default()));
        (app, Outbound::new(shared))
    }

    #[test]
    fn find_service_requests_events_and_subscribes_first_group() {
        let (app, mut outbound) = outbound();
        let events = [
            EventDescriptor::new(0x8004, &[4, 5], EventKind::Event).unwrap(),
            EventDescriptor::new(0x8005, &[], EventKind::Field).unwrap(),
        ];
        outbound.handle_frame(Frame::header_only(WireHeader::find_service(
            0x1001,
            0x1,
            ServiceMetadata::from_events(&events).unwrap(),
        )));

        assert_eq!(
            app.rpc_calls(),
            vec![
                Call::RequestEvent(0x1001, 0x1, 0x8004, vec![4, 5], EventType::Event),
                Call::Subscribe(0x1001, 0x1, 4),
                Call::RequestEvent(0x1001, 0x1, 0x8005, vec![], EventType::Field),
                Call::RequestService(0x1001, 0x1),
            ]
        );
        assert_eq!(
            outbound.advertisements.subscriptions,
            BTreeSet::from([(0x1001, 0x1, 4)])
        );
    }

    #[test]
    fn acks_consume_correlation() {
        let (app, mut outbound) = outbound();
        let mut request = Message::request(0x1010, 0x1, 0x2, Vec::new());
        request.client = 7;
        outbound.shared.table.insert(99, Arc::new(request)).unwrap();

        let mut header = WireHeader::message(0x1010, 0x1, 0x2, 99);
        header.kind = MessageKind::OfferServiceAck;
        outbound.handle_frame(Frame::new(header, WirePayload::from_slice(&[1]).unwrap()));
        outbound.handle_frame(Frame::new(header, WirePayload::from_slice(&[2]).unwrap()));

        let calls = app.rpc_calls();
        let [Call::Send(response)] = calls.as_slice() else {
            panic!("expected exactly one response, got {calls:?}");
        };
        assert_eq!(response.client, 7);
        assert_eq!(response.payload, vec![1]);
    }

    #[test]
    fn bad_records_are_skipped() {
        let (app, mut outbound) = outbound();
        let mut record = [0u8; RECORD_SIZE];
        record[0..4].copy_from_slice(&6u32.to_le_bytes());
        outbound.handle_record(&record);

        encode(
            &Frame::new(
                WireHeader::event(0x1001, 0x1, 0x8004),
                WirePayload::from_slice(&[3]).unwrap(),
            ),
            &mut record,
        );
        outbound.handle_record(&record);
        assert_eq!(
            app.rpc_calls(),
            vec![Call::Notify(0x1001, 0x1, 0x8004, vec![3])]
        );
    }

    #[test]
    fn one_drain_empties_the_queue() {
        let (app, mut outbound) = outbound();
        let transport = MemoryTransport::new();
        let config = TunnelConfig::default();
        let mut subscriber = transport.open_subscriber(&config.from_gateway).unwrap();
        let mut publisher = transport.open_publisher(&config.from_gateway).unwrap();
        for event in 0..7u16 {
            let frame = Frame::new(
                WireHeader::event(0x1001, 0x1, 0x8000 + event),
                WirePayload::from_slice(&[event as u8]).unwrap(),
            );
            encode(&frame, publisher.loan().unwrap());
            publisher.send().unwrap();
        }

        assert_eq!(outbound.drain(subscriber.as_mut()), 7);
        assert!(subscriber.receive().unwrap().is_none());
        assert_eq!(app.rpc_calls().len(), 7);
        assert_eq!(outbound.drain(subscriber.as_mut()), 0);
    }

    #[test]
    fn expired_requests_are_answered_with_error() {
        let (app, outbound) = outbound();
        let mut request = Message::request(0x1000, 0x1, 0x1, vec![1]);
        request.session = 9;
        outbound.shared.table.insert(5, Arc::new(request)).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        outbound.sweep_expired(Duration::from_millis(10));
        assert!(outbound.shared.table.is_empty());
        let calls = app.rpc_calls();
        let [Call::Send(error)] = calls.as_slice() else {
            panic!("expected one error response, got {calls:?}");
        };
        assert_eq!(error.message_type, MessageType::Error);
        assert_eq!(error.return_code, ReturnCode::NotReady);
        assert_eq!(error.session, 9);
    }

    #[test]
    fn withdraw_reverses_advertisements() {
        let app = RecordingApp::new();
        let advertisements = Advertisements {
            offered: BTreeSet::from([(0x1010, 0x1)]),
            requested: BTreeSet::from([(0x1001, 0x1)]),
            subscriptions: BTreeSet::from([(0x1001, 0x1, 4)]),
        };
        assert!(!advertisements.is_empty());
        advertisements.withdraw(app.as_ref());
        assert_eq!(
            app.rpc_calls(),
            vec![
                Call::Unsubscribe(0x1001, 0x1, 4),
                Call::ReleaseService(0x1001, 0x1),
                Call::StopOfferService(0x1010, 0x1),
            ]
        );
    }
}
