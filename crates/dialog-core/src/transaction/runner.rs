//! The generic event loop powering all four transaction machines.
//!
//! The runner owns nothing protocol-specific: it receives commands,
//! asks the [`TransactionLogic`] what to do, applies validated state
//! transitions, and reports to the Transaction User. Terminated is
//! sticky; reaching it ends the task.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::transaction::logic::{TimerHandles, TransactionData, TransactionLogic};
use crate::transaction::{
    AtomicTransactionState, InternalTransactionCommand, TransactionEvent, TransactionState,
};

/// Drive one transaction until Terminated.
pub async fn run_transaction_loop<L>(
    data: Arc<TransactionData>,
    logic: Arc<L>,
    mut cmd_rx: mpsc::Receiver<InternalTransactionCommand>,
) where
    L: TransactionLogic,
{
    let mut timers = TimerHandles::default();
    let id = data.key.clone();
    debug!(%id, kind = ?logic.kind(), "transaction loop starting");

    while let Some(command) = cmd_rx.recv().await {
        let current = data.state.get();
        trace!(%id, ?command, ?current, "transaction command");

        match command {
            InternalTransactionCommand::TransitionTo(next) => {
                if current == next {
                    continue;
                }
                if let Err(e) =
                    AtomicTransactionState::validate_transition(logic.kind(), current, next)
                {
                    error!(%id, error = %e, "invalid state transition");
                    data.emit(TransactionEvent::Error {
                        id: Some(id.clone()),
                        error: e.to_string(),
                    })
                    .await;
                    continue;
                }

                // A transition owns the timer set: entry actions
                // re-arm whatever the new state needs.
                timers.cancel_all();
                let previous = data.state.set(next);
                debug!(%id, ?previous, ?next, "state changed");
                data.emit(TransactionEvent::StateChanged {
                    id: id.clone(),
                    previous,
                    new: next,
                })
                .await;

                if let Err(e) = logic.on_enter_state(&data, next, previous, &mut timers).await {
                    error!(%id, error = %e, "entry action failed");
                    report_failure(&data, &id, e).await;
                    data.state.set(TransactionState::Terminated);
                }
            }
            InternalTransactionCommand::ProcessMessage(message) => {
                match logic.process_message(&data, message, current, &mut timers).await {
                    Ok(Some(next)) => self_transition(&data, next).await,
                    Ok(None) => {}
                    Err(e) => {
                        error!(%id, error = %e, "message processing failed");
                        let fatal = is_transport_failure(&e);
                        report_failure(&data, &id, e).await;
                        if fatal {
                            data.state.set(TransactionState::Terminated);
                        }
                    }
                }
            }
            InternalTransactionCommand::Timer(name) => {
                match logic.handle_timer(&data, name, current, &mut timers).await {
                    Ok(Some(next)) => self_transition(&data, next).await,
                    Ok(None) => {}
                    Err(e) => {
                        error!(%id, timer = name, error = %e, "timer handling failed");
                        let fatal = is_transport_failure(&e);
                        report_failure(&data, &id, e).await;
                        if fatal {
                            data.state.set(TransactionState::Terminated);
                        }
                    }
                }
            }
            InternalTransactionCommand::SendResponse(response) => {
                match logic.send_response(&data, response, current, &mut timers).await {
                    Ok(Some(next)) => self_transition(&data, next).await,
                    Ok(None) => {}
                    Err(e) => {
                        error!(%id, error = %e, "response send failed");
                        data.emit(TransactionEvent::TransportError { id: id.clone() }).await;
                        data.state.set(TransactionState::Terminated);
                    }
                }
            }
            InternalTransactionCommand::TransportError => {
                error!(%id, "transport error, terminating transaction");
                data.emit(TransactionEvent::TransportError { id: id.clone() }).await;
                data.state.set(TransactionState::Terminated);
            }
            InternalTransactionCommand::Terminate => {
                data.state.set(TransactionState::Terminated);
            }
        }

        if data.state.get() == TransactionState::Terminated {
            break;
        }
    }

    timers.cancel_all();
    data.state.set(TransactionState::Terminated);
    debug!(%id, "transaction loop ended");
    data.emit(TransactionEvent::Terminated { id }).await;
}

async fn self_transition(data: &Arc<TransactionData>, next: TransactionState) {
    if data.cmd_tx.send(InternalTransactionCommand::TransitionTo(next)).await.is_err() {
        // The loop is gone; mark terminal directly.
        data.state.set(TransactionState::Terminated);
    }
}

fn is_transport_failure(e: &crate::errors::Error) -> bool {
    matches!(e, crate::errors::Error::TransportFailure(_))
}

/// Transport failures terminate with a typed event; anything else is
/// surfaced as a generic error.
async fn report_failure(
    data: &Arc<TransactionData>,
    id: &crate::transaction::TransactionKey,
    error: crate::errors::Error,
) {
    if is_transport_failure(&error) {
        data.emit(TransactionEvent::TransportError { id: id.clone() }).await;
    } else {
        data.emit(TransactionEvent::Error { id: Some(id.clone()), error: error.to_string() })
            .await;
    }
}
