//! Server transaction state machines (RFC 3261 §17.2).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use waveline_sip_core::{Message, Method, Response, StatusCode};

use crate::errors::Result;
use crate::transaction::logic::{TimerHandles, TransactionData, TransactionLogic};
use crate::transaction::{TransactionEvent, TransactionKind, TransactionState};

/// INVITE server transaction (§17.2.1):
/// Proceeding → Completed → Confirmed → Terminated.
pub struct InviteServerLogic;

#[async_trait]
impl TransactionLogic for InviteServerLogic {
    fn kind(&self) -> TransactionKind {
        TransactionKind::InviteServer
    }

    fn initial_state(&self) -> TransactionState {
        TransactionState::Proceeding
    }

    async fn on_enter_state(
        &self,
        data: &Arc<TransactionData>,
        new_state: TransactionState,
        previous: TransactionState,
        timers: &mut TimerHandles,
    ) -> Result<()> {
        match new_state {
            TransactionState::Proceeding if previous == TransactionState::Initial => {
                // Answer 100 Trying at once so upstream retransmission
                // stops while the TU decides.
                let request = data.request.lock().await.clone();
                let trying = Response::for_request(StatusCode::Trying, &request);
                *data.last_response.lock().await = Some(trying.clone());
                data.send(&Message::Response(trying)).await?;
            }
            TransactionState::Completed => {
                if !data.is_reliable() {
                    data.reset_retransmit_interval().await;
                    timers.schedule("G", data.timers.t1, data.cmd_tx.clone());
                }
                timers.schedule("H", data.timers.transaction_timeout(), data.cmd_tx.clone());
            }
            TransactionState::Confirmed => {
                let wait = if data.is_reliable() { Duration::ZERO } else { data.timers.t4 };
                timers.schedule("I", wait, data.cmd_tx.clone());
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
        let Message::Request(request) = message else {
            warn!(id = %data.key, "server transaction fed a response");
            return Ok(None);
        };
        match (&request.method, current) {
            // Retransmitted INVITE: replay the latest response.
            (Method::Invite, TransactionState::Proceeding)
            | (Method::Invite, TransactionState::Completed) => {
                data.send_last_response().await?;
                Ok(None)
            }
            (Method::Ack, TransactionState::Completed) => {
                data.emit(TransactionEvent::AckReceived { id: data.key.clone(), request }).await;
                Ok(Some(TransactionState::Confirmed))
            }
            // Confirmed absorbs further ACKs silently.
            (Method::Ack, TransactionState::Confirmed) => Ok(None),
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
            ("G", TransactionState::Completed) => {
                debug!(id = %data.key, "timer G: retransmitting final response");
                data.send_last_response().await?;
                let next = data.bump_retransmit_interval().await;
                timers.schedule("G", next, data.cmd_tx.clone());
                Ok(None)
            }
            ("H", TransactionState::Completed) => {
                // ACK never arrived.
                data.emit(TransactionEvent::TimedOut { id: data.key.clone() }).await;
                Ok(Some(TransactionState::Terminated))
            }
            ("I", TransactionState::Confirmed) => Ok(Some(TransactionState::Terminated)),
            _ => Ok(None),
        }
    }

    async fn send_response(
        &self,
        data: &Arc<TransactionData>,
        response: Response,
        current: TransactionState,
        _timers: &mut TimerHandles,
    ) -> Result<Option<TransactionState>> {
        if current != TransactionState::Proceeding {
            warn!(id = %data.key, ?current, "response ignored outside Proceeding");
            return Ok(None);
        }
        let status = response.status;
        *data.last_response.lock().await = Some(response.clone());
        data.send(&Message::Response(response)).await?;
        if status.is_provisional() {
            Ok(None)
        } else if status.is_success() {
            // 2xx retransmission belongs to the TU (§13.3.1.4); the
            // transaction ends right away.
            Ok(Some(TransactionState::Terminated))
        } else {
            Ok(Some(TransactionState::Completed))
        }
    }
}

/// Non-INVITE server transaction (§17.2.2):
/// Trying → Proceeding → Completed → Terminated.
pub struct NonInviteServerLogic;

#[async_trait]
impl TransactionLogic for NonInviteServerLogic {
    fn kind(&self) -> TransactionKind {
        TransactionKind::NonInviteServer
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
        if new_state == TransactionState::Completed {
            let wait = if data.is_reliable() {
                Duration::ZERO
            } else {
                data.timers.transaction_timeout()
            };
            timers.schedule("J", wait, data.cmd_tx.clone());
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
        let Message::Request(_) = message else {
            warn!(id = %data.key, "server transaction fed a response");
            return Ok(None);
        };
        match current {
            // No response chosen yet; absorb the retransmission.
            TransactionState::Trying => Ok(None),
            TransactionState::Proceeding | TransactionState::Completed => {
                data.send_last_response().await?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    async fn handle_timer(
        &self,
        _data: &Arc<TransactionData>,
        name: &'static str,
        current: TransactionState,
        _timers: &mut TimerHandles,
    ) -> Result<Option<TransactionState>> {
        match (name, current) {
            ("J", TransactionState::Completed) => Ok(Some(TransactionState::Terminated)),
            _ => Ok(None),
        }
    }

    async fn send_response(
        &self,
        data: &Arc<TransactionData>,
        response: Response,
        current: TransactionState,
        _timers: &mut TimerHandles,
    ) -> Result<Option<TransactionState>> {
        if !matches!(current, TransactionState::Trying | TransactionState::Proceeding) {
            warn!(id = %data.key, ?current, "response ignored in terminal state");
            return Ok(None);
        }
        let status = response.status;
        *data.last_response.lock().await = Some(response.clone());
        data.send(&Message::Response(response)).await?;
        if status.is_provisional() {
            Ok(match current {
                TransactionState::Trying => Some(TransactionState::Proceeding),
                _ => None,
            })
        } else {
            Ok(Some(TransactionState::Completed))
        }
    }
}
