//! Shared transaction data and the per-kind logic trait consumed by
//! the generic runner.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use waveline_sip_core::{Message, Request, Response};
use waveline_sip_transport::Transport;

use crate::errors::{Error, Result};
use crate::transaction::timer::TimerSettings;
use crate::transaction::{
    AtomicTransactionState, InternalTransactionCommand, TransactionEvent, TransactionKey,
    TransactionKind, TransactionState,
};

/// State shared by every transaction kind: identity, the original
/// request, the last response, channels and timer configuration.
pub struct TransactionData {
    pub key: TransactionKey,
    pub state: Arc<AtomicTransactionState>,
    pub request: Mutex<Request>,
    pub last_response: Mutex<Option<Response>>,
    pub remote: SocketAddr,
    pub transport: Arc<dyn Transport>,
    pub events_tx: mpsc::Sender<TransactionEvent>,
    pub cmd_tx: mpsc::Sender<InternalTransactionCommand>,
    pub timers: TimerSettings,
    /// Current retransmission interval for timers A/E/G.
    pub retransmit_interval: Mutex<Duration>,
}

impl TransactionData {
    /// Unreliable transports retransmit; reliable ones do not.
    pub fn is_reliable(&self) -> bool {
        self.transport.is_reliable()
    }

    /// (Re)send the original request.
    pub async fn send_request(&self) -> Result<()> {
        let request = self.request.lock().await.clone();
        self.transport
            .send_message(&Message::Request(request), self.remote)
            .await
            .map_err(|e| Error::TransportFailure(e.to_string()))
    }

    /// (Re)send the stored response, if any.
    pub async fn send_last_response(&self) -> Result<()> {
        let response = self.last_response.lock().await.clone();
        match response {
            Some(response) => self
                .transport
                .send_message(&Message::Response(response), self.remote)
                .await
                .map_err(|e| Error::TransportFailure(e.to_string())),
            None => Ok(()),
        }
    }

    /// Send a specific message toward the remote party.
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.transport
            .send_message(message, self.remote)
            .await
            .map_err(|e| Error::TransportFailure(e.to_string()))
    }

    /// Deliver an event to the TU; a gone receiver is not an error
    /// during shutdown.
    pub async fn emit(&self, event: TransactionEvent) {
        if self.events_tx.send(event).await.is_err() {
            trace!(id = %self.key, "TU event receiver dropped");
        }
    }

    /// Reset the retransmission ladder to T1.
    pub async fn reset_retransmit_interval(&self) {
        *self.retransmit_interval.lock().await = self.timers.t1;
    }

    /// Advance the ladder and return the interval to wait next.
    pub async fn bump_retransmit_interval(&self) -> Duration {
        let mut interval = self.retransmit_interval.lock().await;
        *interval = self.timers.next_retransmit(*interval);
        *interval
    }
}

/// Handles of the timers currently scheduled for one transaction.
///
/// Timers are plain sleeping tasks that post
/// [`InternalTransactionCommand::Timer`] back to the owning loop.
#[derive(Default)]
pub struct TimerHandles {
    active: HashMap<&'static str, JoinHandle<()>>,
}

impl TimerHandles {
    /// Schedule `name` to fire once after `delay`, replacing any
    /// previous schedule of the same name.
    pub fn schedule(
        &mut self,
        name: &'static str,
        delay: Duration,
        cmd_tx: mpsc::Sender<InternalTransactionCommand>,
    ) {
        self.cancel(name);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = cmd_tx.send(InternalTransactionCommand::Timer(name)).await;
        });
        self.active.insert(name, handle);
        trace!(timer = name, ?delay, "timer scheduled");
    }

    pub fn cancel(&mut self, name: &'static str) {
        if let Some(handle) = self.active.remove(name) {
            handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.active.drain() {
            handle.abort();
        }
    }
}

impl Drop for TimerHandles {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Per-kind behaviour plugged into the generic runner.
#[async_trait]
pub trait TransactionLogic: Send + Sync + 'static {
    fn kind(&self) -> TransactionKind;

    /// First state after the initial request has been sent (client)
    /// or received (server).
    fn initial_state(&self) -> TransactionState;

    /// Entry actions for a state: start/stop timers, send messages.
    async fn on_enter_state(
        &self,
        data: &Arc<TransactionData>,
        new_state: TransactionState,
        previous: TransactionState,
        timers: &mut TimerHandles,
    ) -> Result<()>;

    /// Feed a message; return the state to move to, if any.
    async fn process_message(
        &self,
        data: &Arc<TransactionData>,
        message: Message,
        current: TransactionState,
        timers: &mut TimerHandles,
    ) -> Result<Option<TransactionState>>;

    /// A named timer fired; return the state to move to, if any.
    async fn handle_timer(
        &self,
        data: &Arc<TransactionData>,
        name: &'static str,
        current: TransactionState,
        timers: &mut TimerHandles,
    ) -> Result<Option<TransactionState>>;

    /// TU wants a response sent (server kinds only).
    async fn send_response(
        &self,
        data: &Arc<TransactionData>,
        response: Response,
        current: TransactionState,
        timers: &mut TimerHandles,
    ) -> Result<Option<TransactionState>> {
        let _ = (data, response, current, timers);
        warn!(kind = ?self.kind(), "SendResponse on a client transaction ignored");
        Ok(None)
    }
}
