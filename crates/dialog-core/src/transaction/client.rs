//! Client transaction state machines (RFC 3261 §17.1).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use waveline_sip_core::{
    Header, HeaderAccess, HeaderName, HeaderValue, Message, Method, Request, Response,
};

use crate::errors::{Error, Result};
use crate::transaction::logic::{TimerHandles, TransactionData, TransactionLogic};
use crate::transaction::{TransactionEvent, TransactionKind, TransactionState};

/// INVITE client transaction (§17.1.1):
/// Calling → Proceeding → Completed → Terminated.
pub struct InviteClientLogic;

#[async_trait]
impl TransactionLogic for InviteClientLogic {
    fn kind(&self) -> TransactionKind {
        TransactionKind::InviteClient
    }

    fn initial_state(&self) -> TransactionState {
        TransactionState::Calling
    }

    async fn on_enter_state(
        &self,
        data: &Arc<TransactionData>,
        new_state: TransactionState,
        _previous: TransactionState,
        timers: &mut TimerHandles,
    ) -> Result<()> {
        match new_state {
            TransactionState::Calling => {
                data.send_request().await?;
                if !data.is_reliable() {
                    data.reset_retransmit_interval().await;
                    timers.schedule("A", data.timers.t1, data.cmd_tx.clone());
                }
                timers.schedule("B", data.timers.transaction_timeout(), data.cmd_tx.clone());
            }
            TransactionState::Proceeding => {
                // Provisional received; the INVITE may now wait
                // indefinitely for a final response.
            }
            TransactionState::Completed => {
                // Non-2xx final: ACK it and absorb retransmissions.
                self.ack_last_response(data).await?;
                let wait =
                    if data.is_reliable() { Duration::ZERO } else { data.timers.timer_d };
                timers.schedule("D", wait, data.cmd_tx.clone());
            }
            _ => {}
        }
        Ok(())
    }

    async fn process_message(
        &self,
        data: &Arc<TransactionData>,
        message: Message,
        current: TransactionState,
        _timers: &mut TimerHandles,
    ) -> Result<Option<TransactionState>> {
        let Message::Response(response) = message else {
            warn!(id = %data.key, "client transaction fed a request");
            return Ok(None);
        };
        *data.last_response.lock().await = Some(response.clone());

        let id = data.key.clone();
        if response.status.is_provisional() {
            data.emit(TransactionEvent::ProvisionalResponse { id, response }).await;
            return Ok(match current {
                TransactionState::Calling => Some(TransactionState::Proceeding),
                _ => None,
            });
        }
        if response.status.is_success() {
            // 2xx ends the INVITE client transaction; the TU sends
            // the ACK inside the dialog (RFC 3261 §13.2.2.4).
            data.emit(TransactionEvent::SuccessResponse { id, response }).await;
            return Ok(Some(TransactionState::Terminated));
        }
        match current {
            TransactionState::Calling | TransactionState::Proceeding => {
                data.emit(TransactionEvent::FailureResponse { id, response }).await;
                Ok(Some(TransactionState::Completed))
            }
            TransactionState::Completed => {
                // Retransmitted final: re-ACK, stay put.
                self.ack_last_response(data).await?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    async fn handle_timer(
        &self,
        data: &Arc<TransactionData>,
        name: &'static str,
        current: TransactionState,
        timers: &mut TimerHandles,
    ) -> Result<Option<TransactionState>> {
        match (name, current) {
            ("A", TransactionState::Calling) => {
                debug!(id = %data.key, "timer A: retransmitting INVITE");
                data.send_request().await?;
                let next = data.bump_retransmit_interval().await;
                timers.schedule("A", next, data.cmd_tx.clone());
                Ok(None)
            }
            ("B", TransactionState::Calling) => {
                data.emit(TransactionEvent::TimedOut { id: data.key.clone() }).await;
                Ok(Some(TransactionState::Terminated))
            }
            ("D", TransactionState::Completed) => Ok(Some(TransactionState::Terminated)),
            _ => Ok(None),
        }
    }
}

impl InviteClientLogic {
    /// ACK a non-2xx final response (§17.1.1.3): same branch, same
    /// CSeq number with method ACK, To taken from the response.
    async fn ack_last_response(&self, data: &Arc<TransactionData>) -> Result<()> {
        let request = data.request.lock().await.clone();
        let response = data.last_response.lock().await.clone();
        let Some(response) = response else { return Ok(()) };
        let ack = build_ack_for_non_2xx(&request, &response)?;
        data.send(&Message::Request(ack)).await
    }
}

/// Build the transaction-layer ACK for a non-2xx INVITE response.
pub fn build_ack_for_non_2xx(request: &Request, response: &Response) -> Result<Request> {
    let mut ack = Request::new(Method::Ack, request.uri.clone());
    for header in &request.headers {
        match header.name {
            HeaderName::Via => {
                // Only the topmost Via, same branch.
                if ack.via_top().is_none() {
                    ack.headers.push(header.clone());
                }
            }
            HeaderName::From | HeaderName::CallId | HeaderName::Route | HeaderName::MaxForwards => {
                ack.headers.push(header.clone())
            }
            _ => {}
        }
    }
    // To comes from the response so the tag matches.
    let to = response
        .to_header()
        .ok_or_else(|| Error::BadResponse("response without To".to_string()))?;
    ack.push_header(Header::new(HeaderName::To, HeaderValue::Address(to.clone())));
    let cseq = request
        .cseq()
        .ok_or_else(|| Error::BadRequest("request without CSeq".to_string()))?;
    ack.push_header(Header::new(
        HeaderName::CSeq,
        HeaderValue::CSeq(waveline_sip_core::CSeq::new(cseq.seq, Method::Ack)),
    ));
    Ok(ack)
}

/// Non-INVITE client transaction (§17.1.2):
/// Trying → Proceeding → Completed → Terminated.
pub struct NonInviteClientLogic;

#[async_trait]
impl TransactionLogic for NonInviteClientLogic {
    fn kind(&self) -> TransactionKind {
        TransactionKind::NonInviteClient
    }

    fn initial_state(&self) -> TransactionState {
        TransactionState::Trying
    }

    async fn on_enter_state(
        &self,
        data: &Arc<TransactionData>,
        new_state: TransactionState,
        _previous: TransactionState,
        timers: &mut TimerHandles,
    ) -> Result<()> {
        match new_state {
            TransactionState::Trying => {
                data.send_request().await?;
                if !data.is_reliable() {
                    data.reset_retransmit_interval().await;
                    timers.schedule("E", data.timers.t1, data.cmd_tx.clone());
                }
                timers.schedule("F", data.timers.transaction_timeout(), data.cmd_tx.clone());
            }
            TransactionState::Proceeding => {
                // Retransmissions continue at the T2 cap.
                if !data.is_reliable() {
                    timers.schedule("E", data.timers.t2, data.cmd_tx.clone());
                }
                timers.schedule("F", data.timers.transaction_timeout(), data.cmd_tx.clone());
            }
            TransactionState::Completed => {
                let wait = if data.is_reliable() { Duration::ZERO } else { data.timers.t4 };
                timers.schedule("K", wait, data.cmd_tx.clone());
            }
            _ => {}
        }
        Ok(())
    }

    async fn process_message(
        &self,
        data: &Arc<TransactionData>,
        message: Message,
        current: TransactionState,
        _timers: &mut TimerHandles,
    ) -> Result<Option<TransactionState>> {
        let Message::Response(response) = message else {
            warn!(id = %data.key, "client transaction fed a request");
            return Ok(None);
        };
        *data.last_response.lock().await = Some(response.clone());

        let id = data.key.clone();
        if response.status.is_provisional() {
            data.emit(TransactionEvent::ProvisionalResponse { id, response }).await;
            return Ok(match current {
                TransactionState::Trying => Some(TransactionState::Proceeding),
                _ => None,
            });
        }
        match current {
            TransactionState::Trying | TransactionState::Proceeding => {
                if response.status.is_success() {
                    data.emit(TransactionEvent::SuccessResponse { id, response }).await;
                } else {
                    data.emit(TransactionEvent::FailureResponse { id, response }).await;
                }
                Ok(Some(TransactionState::Completed))
            }
            // Completed absorbs retransmissions.
            _ => Ok(None),
        }
    }

    async fn handle_timer(
        &self,
        data: &Arc<TransactionData>,
        name: &'static str,
        current: TransactionState,
        timers: &mut TimerHandles,
    ) -> Result<Option<TransactionState>> {
        match (name, current) {
            ("E", TransactionState::Trying) => {
                data.send_request().await?;
                let next = data.bump_retransmit_interval().await;
                timers.schedule("E", next, data.cmd_tx.clone());
                Ok(None)
            }
            ("E", TransactionState::Proceeding) => {
                data.send_request().await?;
                timers.schedule("E", data.timers.t2, data.cmd_tx.clone());
                Ok(None)
            }
            ("F", TransactionState::Trying) | ("F", TransactionState::Proceeding) => {
                data.emit(TransactionEvent::TimedOut { id: data.key.clone() }).await;
                Ok(Some(TransactionState::Terminated))
            }
            ("K", TransactionState::Completed) => Ok(Some(TransactionState::Terminated)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waveline_sip_core::parse_request;

    #[test]
    fn ack_for_non_2xx_mirrors_invite() {
        let raw = "INVITE sip:bob@biloxi.com SIP/2.0\r\n\
            Via: SIP/2.0/UDP atlanta.com;branch=z9hG4bKack1\r\nMax-Forwards: 70\r\n\
            To: <sip:bob@biloxi.com>\r\nFrom: <sip:alice@atlanta.com>;tag=aa\r\n\
            Call-ID: ack-test\r\nCSeq: 7 INVITE\r\n\r\n";
        let invite = parse_request(raw.as_bytes()).unwrap();
        let mut response =
            Response::for_request(waveline_sip_core::StatusCode::BusyHere, &invite);
        let mut to = response.to_header().unwrap().clone();
        to.set_tag("bb");
        response.set_header(Header::new(HeaderName::To, HeaderValue::Address(to)));

        let ack = build_ack_for_non_2xx(&invite, &response).unwrap();
        assert_eq!(ack.method, Method::Ack);
        assert_eq!(ack.uri, invite.uri);
        assert_eq!(ack.via_top().unwrap().branch(), Some("z9hG4bKack1"));
        assert_eq!(ack.to_header().unwrap().tag(), Some("bb"));
        let cseq = ack.cseq().unwrap();
        assert_eq!(cseq.seq, 7);
        assert_eq!(cseq.method, Method::Ack);
    }
}
