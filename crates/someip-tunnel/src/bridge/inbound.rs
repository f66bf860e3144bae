//! RPC → IPC translation.
//!
//! Each RPC callback produces at most one frame. For requests the
//! correlation entry is recorded before the frame is published, so a
//! response can never arrive ahead of its entry.

use std::sync::Arc;

use super::Shared;
use crate::correlation::{NO_CORRELATION, new_correlation_id};
use crate::rpc::{InstanceId, Message, MessageType, ReturnCode, ServiceId, State};
use crate::wire::{Frame, WireHeader, WirePayload};

pub struct Inbound {
    shared: Arc<Shared>,
}

impl Inbound {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn on_state(&self, state: State) {
        match state {
            State::Registered => {
                tracing::info!(app = %self.shared.config.app_name, "Registered with RPC runtime")
            }
            State::Deregistered => {
                tracing::debug!(app = %self.shared.config.app_name, "Deregistered from RPC runtime")
            }
        }
    }

    pub fn on_availability(&self, service: ServiceId, instance: InstanceId, available: bool) {
        tracing::debug!(
            service = %format_args!("{service:#06x}"),
            instance = %format_args!("{instance:#06x}"),
            available,
            "Service availability changed"
        );
        let frame = Frame::header_only(WireHeader::availability(service, instance, available));
        if let Err(e) = self.shared.publish(&frame) {
            tracing::error!(error = %e, %frame, "Failed to publish availability");
        }
    }

    pub fn on_message(&self, message: Arc<Message>) {
        match message.message_type {
            MessageType::Request => self.forward_request(message),
            MessageType::RequestNoReturn => {
                self.forward(&message, |m| {
                    WireHeader::message(m.service, m.instance, m.method, NO_CORRELATION)
                })
            }
            MessageType::Notification => {
                self.forward(&message, |m| WireHeader::event(m.service, m.instance, m.method))
            }
            MessageType::Response | MessageType::Error => {
                tracing::debug!(%message, "Ignoring response addressed to the tunnel");
            }
        }
    }

    fn payload(&self, message: &Message) -> Option<WirePayload> {
        match WirePayload::from_slice(&message.payload) {
            Ok(payload) => Some(payload),
            Err(e) => {
                tracing::error!(error = %e, %message, "Rejecting message");
                if message.message_type.expects_response() {
                    self.shared.reply_error(message, ReturnCode::MalformedMessage);
                }
                None
            }
        }
    }

    fn forward_request(&self, request: Arc<Message>) {
        let Some(payload) = self.payload(&request) else {
            return;
        };

        let id = new_correlation_id();
        if let Err(e) = self.shared.table.insert(id, Arc::clone(&request)) {
            tracing::error!(error = %e, %request, "Dropping request");
            return;
        }

        let frame = Frame::new(
            WireHeader::message(request.service, request.instance, request.method, id),
            payload,
        );
        if let Err(e) = self.shared.publish(&frame) {
            tracing::error!(error = %e, %frame, "Failed to publish request");
            if let Some(request) = self.shared.table.take(id) {
                self.shared.reply_error(&request, ReturnCode::NotReady);
            }
        }
    }

    fn forward(&self, message: &Message, header: impl FnOnce(&Message) -> WireHeader) {
        let Some(payload) = self.payload(message) else {
            return;
        };
        let frame = Frame::new(header(message), payload);
        if let Err(e) = self.shared.publish(&frame) {
            tracing::error!(error = %e, %frame, "Failed to publish frame");
        }
    }
}
