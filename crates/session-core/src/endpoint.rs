//! The endpoint: session table, module registry, message routing and
//! the event loop gluing the transaction layer to INVITE sessions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use waveline_dialog_core::transaction::TransactionKey;
use waveline_dialog_core::{
    Authenticator, Credential, Dialog, DialogId, DialogManager, TimerSettings, TransactionEvent,
    TransactionManager,
};
use waveline_infra_common::CoreConfig;
use waveline_sip_core::sdp::{MediaDescription, SessionDescription};
use waveline_sip_core::{
    Address, CSeq, Header, HeaderAccess, HeaderName, HeaderValue, Method, Request, Response,
    StatusCode, Uri, Via, ViaTransport, generate_tag,
};
use waveline_sip_transport::{Transport, UdpTransport};

use crate::errors::{Error, Result};
use crate::events::SessionEvent;
use crate::redirect::{RedirectAction, RedirectPolicy};
use crate::session::{EngineCommand, InviteSession, Role};
use crate::types::{CallState, SessionId};

/// Extension tags we advertise in `Supported`.
const SUPPORTED_TAGS: [&str; 3] = ["100rel", "replaces", "timer"];

/// Verdict of a module on an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Stop walking; the module owned the message.
    Consumed,
    /// Keep walking.
    Pass,
}

/// A pluggable endpoint module. Modules see every inbound message
/// before the built-in routing, in ascending priority order.
pub trait EndpointModule: Send + Sync {
    fn name(&self) -> &str;
    /// Lower runs earlier.
    fn priority(&self) -> u8;
    fn on_rx_request(&self, request: &Request) -> Handled {
        let _ = request;
        Handled::Pass
    }
    fn on_rx_response(&self, response: &Response) -> Handled {
        let _ = response;
        Handled::Pass
    }
}

/// The process-wide endpoint.
pub struct Endpoint {
    config: CoreConfig,
    tm: Arc<TransactionManager>,
    transport: Arc<dyn Transport>,
    dialogs: Arc<DialogManager>,
    sessions: DashMap<SessionId, Arc<Mutex<InviteSession>>>,
    by_dialog: DashMap<DialogId, SessionId>,
    by_server_tsx: DashMap<TransactionKey, SessionId>,
    modules: std::sync::RwLock<Vec<Arc<dyn EndpointModule>>>,
    events_tx: mpsc::Sender<SessionEvent>,
    engine_tx: mpsc::Sender<EngineCommand>,
    redirect_policy: Arc<RedirectPolicy>,
    credentials: Vec<Credential>,
    timers: TimerSettings,
    local_addr: SocketAddr,
    identity: Address,
    contact: Address,
    quitting: AtomicBool,
}

impl Endpoint {
    /// Bind a UDP endpoint and start its engine loop.
    pub async fn bind(
        config: CoreConfig,
        addr: SocketAddr,
        identity: Address,
    ) -> Result<(Arc<Endpoint>, mpsc::Receiver<SessionEvent>)> {
        Self::bind_with(config, addr, identity, None, Vec::new()).await
    }

    /// Bind with explicit timer settings (tests) and credentials.
    pub async fn bind_with(
        config: CoreConfig,
        addr: SocketAddr,
        identity: Address,
        timers: Option<TimerSettings>,
        credentials: Vec<Credential>,
    ) -> Result<(Arc<Endpoint>, mpsc::Receiver<SessionEvent>)> {
        let (transport, transport_rx) = UdpTransport::bind(addr, None)
            .await
            .map_err(waveline_dialog_core::Error::from)?;
        let local_addr =
            transport.local_addr().map_err(waveline_dialog_core::Error::from)?;
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let timers = timers.unwrap_or_default();
        let (tm, tu_rx) =
            TransactionManager::new(transport.clone(), transport_rx, Some(timers.clone()));

        let (events_tx, events_rx) = mpsc::channel(256);
        let (engine_tx, engine_rx) = mpsc::channel(64);

        let contact: Address = Address::new(
            Uri::sip_user(
                identity.uri.user.clone().unwrap_or_else(|| "waveline".to_string()),
                local_addr.ip().to_string(),
            )
            .with_port(local_addr.port()),
        );

        let endpoint = Arc::new(Endpoint {
            config,
            tm,
            transport,
            dialogs: Arc::new(DialogManager::new()),
            sessions: DashMap::new(),
            by_dialog: DashMap::new(),
            by_server_tsx: DashMap::new(),
            modules: std::sync::RwLock::new(Vec::new()),
            events_tx,
            engine_tx,
            redirect_policy: Arc::new(|_: &Address| RedirectAction::Accept),
            credentials,
            timers,
            local_addr,
            identity,
            contact,
            quitting: AtomicBool::new(false),
        });

        endpoint.clone().spawn_engine(tu_rx, engine_rx);
        info!(%local_addr, "endpoint up");
        Ok((endpoint, events_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn contact(&self) -> &Address {
        &self.contact
    }

    /// Register a module; the registry stays priority-sorted.
    pub fn register_module(&self, module: Arc<dyn EndpointModule>) {
        let mut modules = self.modules.write().unwrap();
        modules.push(module);
        modules.sort_by_key(|m| m.priority());
    }

    fn walk_modules_request(&self, request: &Request) -> Handled {
        for module in self.modules.read().unwrap().iter() {
            if module.on_rx_request(request) == Handled::Consumed {
                debug!(module = module.name(), "request consumed by module");
                return Handled::Consumed;
            }
        }
        Handled::Pass
    }

    fn walk_modules_response(&self, response: &Response) -> Handled {
        for module in self.modules.read().unwrap().iter() {
            if module.on_rx_response(response) == Handled::Consumed {
                return Handled::Consumed;
            }
        }
        Handled::Pass
    }

    /// Sessions not yet disconnected.
    pub fn active_calls(&self) -> usize {
        self.sessions.len()
    }

    // ------------------------------------------------------------------
    // Application surface
    // ------------------------------------------------------------------

    /// Start an outgoing call. The target host must resolve to an IP
    /// literal here; name resolution belongs to the external
    /// resolver.
    pub async fn make_call(
        &self,
        target: Uri,
        offer: SessionDescription,
    ) -> Result<SessionId> {
        if self.quitting.load(Ordering::Relaxed) {
            return Err(Error::InvalidState("endpoint is shutting down".to_string()));
        }
        if self.sessions.len() >= self.config.sig.effective_max_calls() {
            return Err(Error::NoFreeSlot);
        }

        let remote_addr = resolve_uri(&target)?;

        let mut from = self.identity.clone();
        from.set_tag(generate_tag());
        let call_id = uuid::Uuid::new_v4().to_string();

        let mut invite = Request::new(Method::Invite, target.clone());
        invite.push_header(Header::new(
            HeaderName::Via,
            HeaderValue::Via(Via::new(
                ViaTransport::Udp,
                self.local_addr.ip().to_string(),
                Some(self.local_addr.port()),
            )),
        ));
        invite.push_header(Header::new(HeaderName::MaxForwards, HeaderValue::UInt(70)));
        // Configured outbound proxies become the initial route set.
        for proxy in &self.config.sig.outbound_proxies {
            match proxy.parse::<Address>() {
                Ok(route) => invite
                    .push_header(Header::new(HeaderName::Route, HeaderValue::Address(route))),
                Err(e) => warn!(%proxy, error = %e, "ignoring unparseable outbound proxy"),
            }
        }
        invite.push_header(Header::new(HeaderName::From, HeaderValue::Address(from)));
        invite.push_header(Header::new(
            HeaderName::To,
            HeaderValue::Address(Address::new(target)),
        ));
        invite.push_header(Header::new(HeaderName::CallId, HeaderValue::Raw(call_id)));
        invite.push_header(Header::new(
            HeaderName::CSeq,
            HeaderValue::CSeq(CSeq::new(1, Method::Invite)),
        ));
        invite.push_header(Header::new(
            HeaderName::Contact,
            HeaderValue::Address(self.contact.clone()),
        ));
        self.add_capability_headers(&mut invite);
        let invite = invite.with_body("application/sdp", offer.print());

        let dialog = Dialog::new_uac(&invite, self.contact.clone())?;
        let dialog_id = dialog.id.clone();
        let dialog = self.dialogs.insert(dialog);

        let session_id = SessionId::fresh();
        let mut session = InviteSession::new(
            session_id.clone(),
            Role::Uac,
            dialog,
            self.tm.clone(),
            self.events_tx.clone(),
            self.engine_tx.clone(),
            self.timers.clone(),
            self.local_addr.ip().to_string(),
            self.local_addr.port(),
            self.contact.clone(),
            remote_addr,
            Authenticator::new(self.credentials.clone()),
        );
        session.start_uac(invite, offer).await?;

        self.by_dialog.insert(dialog_id, session_id.clone());
        self.sessions.insert(session_id.clone(), Arc::new(Mutex::new(session)));
        Ok(session_id)
    }

    /// Answer an incoming call (or push a provisional).
    pub async fn answer(
        &self,
        session: &SessionId,
        status: StatusCode,
        sdp: Option<SessionDescription>,
    ) -> Result<()> {
        let entry = self.session(session)?;
        let mut session_guard = entry.lock().await;
        session_guard.answer(status, None, sdp).await?;
        drop(session_guard);
        self.reap(session).await;
        Ok(())
    }

    /// Hang up / cancel / reject, whatever the state calls for.
    pub async fn end_session(&self, session: &SessionId, code: u16) -> Result<()> {
        let entry = self.session(session)?;
        let mut guard = entry.lock().await;
        guard.end_session(code, None).await?;
        drop(guard);
        self.reap(session).await;
        Ok(())
    }

    /// Send a re-INVITE with a new offer.
    pub async fn reinvite(
        &self,
        session: &SessionId,
        offer: SessionDescription,
    ) -> Result<()> {
        self.session(session)?.lock().await.reinvite(offer).await
    }

    /// Put the call on hold / take it off hold.
    pub async fn set_hold(&self, session: &SessionId, hold: bool) -> Result<()> {
        self.session(session)?.lock().await.set_hold(hold).await
    }

    /// Ask the peer to call somewhere else (blind transfer).
    pub async fn refer(&self, session: &SessionId, target: &Address) -> Result<()> {
        self.session(session)?.lock().await.refer(target).await
    }

    /// Push transfer progress toward the referrer.
    pub async fn notify_transfer(
        &self,
        session: &SessionId,
        status: u16,
        reason: &str,
    ) -> Result<()> {
        self.session(session)?.lock().await.notify_transfer(status, reason).await
    }

    /// Resolve a parked redirect decision.
    pub async fn process_redirect(&self, session: &SessionId, accept: bool) -> Result<()> {
        let policy = self.redirect_policy.clone();
        self.session(session)?.lock().await.process_redirect(accept, &*policy).await
    }

    /// Current state of a session.
    pub async fn call_state(&self, session: &SessionId) -> Result<CallState> {
        Ok(self.session(session)?.lock().await.state())
    }

    /// Graceful teardown: stop taking calls, hang everything up, give
    /// the BYEs a second to fly, then close the transport.
    pub async fn shutdown(&self) {
        self.quitting.store(true, Ordering::Relaxed);
        let ids: Vec<SessionId> =
            self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let _ = self.end_session(&id, StatusCode::Ok.as_u16()).await;
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while self.sessions.len() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let _ = self.transport.close().await;
        info!("endpoint down");
    }

    fn session(&self, id: &SessionId) -> Result<Arc<Mutex<InviteSession>>> {
        self.sessions
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::UnknownSession(id.to_string()))
    }

    /// Drop disconnected sessions and their dialog bookkeeping.
    async fn reap(&self, id: &SessionId) {
        let Some(entry) = self.sessions.get(id).map(|e| e.value().clone()) else { return };
        let guard = entry.lock().await;
        if guard.state() != CallState::Disconnected {
            return;
        }
        let dialog = guard.dialog();
        drop(guard);
        let dialog_id = { dialog.lock().await.id.clone() };
        self.by_dialog.remove(&dialog_id);
        let _ = self.dialogs.remove(&dialog_id);
        self.sessions.remove(id);
        debug!(session = %id, "session reaped");
    }

    // ------------------------------------------------------------------
    // Engine loop
    // ------------------------------------------------------------------

    fn spawn_engine(
        self: Arc<Self>,
        mut tu_rx: mpsc::Receiver<TransactionEvent>,
        mut engine_rx: mpsc::Receiver<EngineCommand>,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = tu_rx.recv() => {
                        let Some(event) = event else { break };
                        if let Err(e) = self.on_transaction_event(event).await {
                            warn!(error = %e, "event handling failed");
                        }
                    }
                    command = engine_rx.recv() => {
                        let Some(command) = command else { break };
                        match command {
                            EngineCommand::AckTimeout(session_id) => {
                                if let Ok(entry) = self.session(&session_id) {
                                    let _ = entry.lock().await.on_ack_timeout().await;
                                    self.reap(&session_id).await;
                                }
                            }
                        }
                    }
                }
            }
            debug!("engine loop ended");
        });
    }

    async fn on_transaction_event(&self, event: TransactionEvent) -> Result<()> {
        match event {
            TransactionEvent::NewRequest { id, request, source } => {
                if self.walk_modules_request(&request) == Handled::Consumed {
                    return Ok(());
                }
                self.route_request(id, request, source).await
            }
            TransactionEvent::ProvisionalResponse { response, .. } => {
                if self.walk_modules_response(&response) == Handled::Consumed {
                    return Ok(());
                }
                if let Some((_, entry)) = self.session_for_response(&response).await {
                    self.with_dialog_rekey(&response, || async {
                        entry.lock().await.on_provisional(&response).await
                    })
                    .await?;
                }
                Ok(())
            }
            TransactionEvent::SuccessResponse { response, .. } => {
                if self.walk_modules_response(&response) == Handled::Consumed {
                    return Ok(());
                }
                self.route_success(&response).await
            }
            TransactionEvent::FailureResponse { response, .. } => {
                if self.walk_modules_response(&response) == Handled::Consumed {
                    return Ok(());
                }
                self.route_failure(&response).await
            }
            TransactionEvent::StrayResponse { response, .. } => {
                // 2xx retransmissions for INVITE land here once the
                // client transaction is gone; re-ACK through the
                // session.
                if response.cseq().map(|c| c.method == Method::Invite).unwrap_or(false)
                    && response.status.is_success()
                {
                    self.route_success(&response).await
                } else {
                    Ok(())
                }
            }
            TransactionEvent::StrayAck { request, .. } => {
                if let Some(dialog) = self.dialogs.match_request(&request) {
                    if let Some(entry) = self.session_for_dialog(&dialog).await {
                        entry.lock().await.on_ack(&request).await?;
                    }
                }
                Ok(())
            }
            TransactionEvent::AckReceived { id, request } => {
                // Clone out of the map before awaiting anything.
                let session_id = self.by_server_tsx.get(&id).map(|e| e.value().clone());
                if let Some(session_id) = session_id {
                    if let Ok(entry) = self.session(&session_id) {
                        entry.lock().await.on_ack(&request).await?;
                    }
                }
                Ok(())
            }
            TransactionEvent::CancelReceived { id, .. } => {
                let session_id = self.by_server_tsx.get(&id).map(|e| e.value().clone());
                if let Some(session_id) = session_id {
                    if let Ok(entry) = self.session(&session_id) {
                        entry.lock().await.on_cancel().await?;
                        self.reap(&session_id).await;
                    }
                }
                Ok(())
            }
            TransactionEvent::TimedOut { id } | TransactionEvent::TransportError { id } => {
                self.fail_session_for_tsx(&id).await
            }
            TransactionEvent::Terminated { id } => {
                self.by_server_tsx.remove(&id);
                Ok(())
            }
            TransactionEvent::Error { error, .. } => {
                let _ = self
                    .events_tx
                    .send(SessionEvent::Error { session: None, error })
                    .await;
                Ok(())
            }
            TransactionEvent::StateChanged { .. } => Ok(()),
        }
    }

    /// A transaction died under a session: find the owner and tear it
    /// down with a timeout cause.
    async fn fail_session_for_tsx(&self, key: &TransactionKey) -> Result<()> {
        let candidates: Vec<(SessionId, Arc<Mutex<InviteSession>>)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (id, session) in candidates {
            let mut guard = session.lock().await;
            if !guard.owns_client_tsx(key) {
                continue;
            }
            if guard.state() != CallState::Disconnected {
                guard
                    .fail_with_cause(
                        StatusCode::RequestTimeout.as_u16(),
                        "Transaction timeout",
                    )
                    .await;
            }
            drop(guard);
            self.reap(&id).await;
            break;
        }
        Ok(())
    }

    async fn session_for_dialog(
        &self,
        dialog: &Arc<Mutex<Dialog>>,
    ) -> Option<Arc<Mutex<InviteSession>>> {
        let dialog_id = { dialog.lock().await.id.clone() };
        let session_id = self.by_dialog.get(&dialog_id)?.value().clone();
        self.sessions.get(&session_id).map(|e| e.value().clone())
    }

    async fn session_for_response(
        &self,
        response: &Response,
    ) -> Option<(SessionId, Arc<Mutex<InviteSession>>)> {
        let dialog = self.dialogs.match_response(response)?;
        let dialog_id = { dialog.lock().await.id.clone() };
        let session_id = self.by_dialog.get(&dialog_id)?.value().clone();
        let session = self.sessions.get(&session_id)?.value().clone();
        Some((session_id, session))
    }

    /// Run a handler, then re-key the dialog if the response taught
    /// it the remote tag.
    async fn with_dialog_rekey<F, Fut>(&self, response: &Response, f: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let before = match self.dialogs.match_response(response) {
            Some(d) => Some(d.lock().await.id.clone()),
            None => None,
        };
        f().await?;
        if let (Some(old_id), Some(dialog)) = (before, self.dialogs.match_response(response)) {
            let new_id = { dialog.lock().await.id.clone() };
            if new_id != old_id {
                self.dialogs.rekey(&old_id, new_id.clone());
                if let Some((_, session_id)) = self.by_dialog.remove(&old_id) {
                    self.by_dialog.insert(new_id, session_id);
                }
            }
        }
        Ok(())
    }

    async fn route_success(&self, response: &Response) -> Result<()> {
        let method = response.cseq().map(|c| c.method.clone());
        match method {
            Some(Method::Invite) => {
                if let Some((session_id, entry)) = self.session_for_response(response).await {
                    self.with_dialog_rekey(response, || async {
                        entry.lock().await.on_invite_success(response).await
                    })
                    .await?;
                    self.reap(&session_id).await;
                }
                Ok(())
            }
            // 2xx to BYE/CANCEL/REFER/NOTIFY need no session action.
            _ => Ok(()),
        }
    }

    async fn route_failure(&self, response: &Response) -> Result<()> {
        let method = response.cseq().map(|c| c.method.clone());
        match method {
            Some(Method::Invite) => {
                if let Some((session_id, entry)) = self.session_for_response(response).await {
                    let policy = self.redirect_policy.clone();
                    entry.lock().await.on_invite_failure(response, &*policy).await?;
                    self.reap(&session_id).await;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn route_request(
        &self,
        server_key: TransactionKey,
        request: Request,
        source: SocketAddr,
    ) -> Result<()> {
        // In-dialog requests first.
        if let Some(dialog) = self.dialogs.match_request(&request) {
            // CSeq discipline before anything else.
            {
                let mut guard = dialog.lock().await;
                if let Err(e) = guard.validate_remote_cseq(&request) {
                    warn!(error = %e, "stale in-dialog request");
                    let response =
                        Response::for_request(StatusCode::ServerInternalError, &request);
                    return Ok(self.tm.send_response(&server_key, response).await?);
                }
            }
            let Some(entry) = self.session_for_dialog(&dialog).await else {
                let response =
                    Response::for_request(StatusCode::CallOrTransactionDoesNotExist, &request);
                return Ok(self.tm.send_response(&server_key, response).await?);
            };
            let session_id = { entry.lock().await.id.clone() };

            match request.method {
                Method::Bye => {
                    entry.lock().await.on_bye(&server_key, &request).await?;
                    self.reap(&session_id).await;
                }
                Method::Invite => {
                    self.by_server_tsx.insert(server_key.clone(), session_id);
                    entry.lock().await.on_reinvite(&request, server_key).await?;
                }
                Method::Update => {
                    entry.lock().await.on_update(&request, &server_key).await?;
                }
                Method::Refer => {
                    let refer_to =
                        entry.lock().await.on_refer(&request, &server_key).await?;
                    let _ = self
                        .events_tx
                        .send(SessionEvent::TransferRequested {
                            session: session_id,
                            refer_to,
                        })
                        .await;
                }
                Method::Notify => {
                    entry.lock().await.on_notify(&request, &server_key).await?;
                }
                Method::Options => {
                    let response = self.options_response(&request);
                    self.tm.send_response(&server_key, response).await?;
                }
                Method::Info | Method::Message => {
                    let response = Response::for_request(StatusCode::Ok, &request);
                    self.tm.send_response(&server_key, response).await?;
                }
                _ => {
                    let response =
                        Response::for_request(StatusCode::NotImplemented, &request);
                    self.tm.send_response(&server_key, response).await?;
                }
            }
            return Ok(());
        }

        // Out-of-dialog.
        if request.to_header().and_then(Address::tag).is_some() {
            // Mid-dialog request for a dialog we do not have.
            let response =
                Response::for_request(StatusCode::CallOrTransactionDoesNotExist, &request);
            return Ok(self.tm.send_response(&server_key, response).await?);
        }

        match request.method {
            Method::Invite => self.route_new_invite(server_key, request, source).await,
            Method::Options => {
                let response = self.options_response(&request);
                Ok(self.tm.send_response(&server_key, response).await?)
            }
            Method::Refer | Method::Notify | Method::Bye | Method::Update => {
                let response =
                    Response::for_request(StatusCode::CallOrTransactionDoesNotExist, &request);
                Ok(self.tm.send_response(&server_key, response).await?)
            }
            _ => {
                let mut response =
                    Response::for_request(StatusCode::MethodNotAllowed, &request);
                response.push_header(allow_header());
                Ok(self.tm.send_response(&server_key, response).await?)
            }
        }
    }

    async fn route_new_invite(
        &self,
        server_key: TransactionKey,
        request: Request,
        source: SocketAddr,
    ) -> Result<()> {
        if self.quitting.load(Ordering::Relaxed) {
            let response = Response::for_request(StatusCode::ServiceUnavailable, &request);
            return Ok(self.tm.send_response(&server_key, response).await?);
        }
        // Capacity gate: no free slot is an immediate 486.
        if self.sessions.len() >= self.config.sig.effective_max_calls() {
            let response = Response::for_request(StatusCode::BusyHere, &request);
            return Ok(self.tm.send_response(&server_key, response).await?);
        }

        let offer = match self.verify_invite(&request) {
            Ok(offer) => offer,
            Err(mut response) => {
                // Tag the To so the reject forms a proper dialog-less
                // final response.
                if let Some(to_slot) =
                    response.headers.iter_mut().find(|h| h.name == HeaderName::To)
                {
                    if let HeaderValue::Address(to) = &mut to_slot.value {
                        if to.tag().is_none() {
                            to.set_tag(generate_tag());
                        }
                    }
                }
                return Ok(self.tm.send_response(&server_key, response).await?);
            }
        };

        let dialog = Dialog::new_uas(&request, self.contact.clone())?;
        let dialog_id = dialog.id.clone();
        let dialog = self.dialogs.insert(dialog);

        let from = request.from_header().cloned().unwrap_or_else(|| {
            Address::new("sip:unknown".parse().unwrap())
        });

        let session_id = SessionId::fresh();
        let mut session = InviteSession::new(
            session_id.clone(),
            Role::Uas,
            dialog,
            self.tm.clone(),
            self.events_tx.clone(),
            self.engine_tx.clone(),
            self.timers.clone(),
            self.local_addr.ip().to_string(),
            self.local_addr.port(),
            self.contact.clone(),
            source,
            Authenticator::new(self.credentials.clone()),
        );
        session.start_uas(request, server_key.clone(), offer.clone()).await?;

        self.by_dialog.insert(dialog_id, session_id.clone());
        self.by_server_tsx.insert(server_key, session_id.clone());
        self.sessions.insert(session_id.clone(), Arc::new(Mutex::new(session)));

        let _ = self
            .events_tx
            .send(SessionEvent::IncomingCall { session: session_id, from, offer })
            .await;
        Ok(())
    }

    /// Admission checks on an initial INVITE: Require tags, body
    /// type, SDP validity.
    fn verify_invite(
        &self,
        request: &Request,
    ) -> std::result::Result<Option<SessionDescription>, Response> {
        // Unknown Require tags: 420 with Unsupported.
        let mut unsupported: Vec<String> = Vec::new();
        for header in request.headers_named(&HeaderName::Require) {
            if let HeaderValue::Token(tokens) = &header.value {
                for tag in tokens.split(',') {
                    let tag = tag.trim();
                    if !SUPPORTED_TAGS.contains(&tag) && !tag.is_empty() {
                        unsupported.push(tag.to_string());
                    }
                }
            }
        }
        if !unsupported.is_empty() {
            let mut response = Response::for_request(StatusCode::BadExtension, request);
            response.push_header(Header::new(
                HeaderName::Unsupported,
                HeaderValue::Token(unsupported.join(", ")),
            ));
            return Err(response);
        }

        if request.body.is_empty() {
            return Ok(None);
        }
        let is_sdp = request
            .content_type()
            .map(|ct| ct.trim().eq_ignore_ascii_case("application/sdp"))
            .unwrap_or(false);
        if !is_sdp {
            return Err(Response::for_request(StatusCode::UnsupportedMediaType, request));
        }
        match std::str::from_utf8(&request.body).ok().map(|s| s.parse::<SessionDescription>()) {
            Some(Ok(sdp)) => Ok(Some(sdp)),
            _ => Err(Response::for_request(StatusCode::NotAcceptableHere, request)),
        }
    }

    /// OPTIONS answer: capabilities plus an SDP probe body.
    fn options_response(&self, request: &Request) -> Response {
        let mut sdp = SessionDescription::new(self.local_addr.ip().to_string());
        let mut audio = MediaDescription::audio(self.local_addr.port());
        audio.push_format(0, "PCMU", 8000, 1);
        audio.push_format(8, "PCMA", 8000, 1);
        sdp.media.push(audio);

        let mut response = Response::for_request(StatusCode::Ok, request);
        response.push_header(allow_header());
        response.push_header(Header::new(
            HeaderName::Accept,
            HeaderValue::Token("application/sdp".to_string()),
        ));
        response.push_header(Header::new(
            HeaderName::Supported,
            HeaderValue::Token(SUPPORTED_TAGS.join(", ")),
        ));
        response.push_header(Header::new(
            HeaderName::UserAgent,
            HeaderValue::Raw(self.config.sig.user_agent.clone()),
        ));
        response.with_body("application/sdp", sdp.print())
    }

    fn add_capability_headers(&self, request: &mut Request) {
        request.push_header(allow_header());
        request.push_header(Header::new(
            HeaderName::Supported,
            HeaderValue::Token(SUPPORTED_TAGS.join(", ")),
        ));
        request.push_header(Header::new(
            HeaderName::UserAgent,
            HeaderValue::Raw(self.config.sig.user_agent.clone()),
        ));
    }
}

fn allow_header() -> Header {
    Header::new(
        HeaderName::Allow,
        HeaderValue::Token(
            "INVITE, ACK, BYE, CANCEL, OPTIONS, REGISTER, PRACK, UPDATE, REFER, SUBSCRIBE, NOTIFY, MESSAGE, INFO".to_string(),
        ),
    )
}

/// Map a URI to a socket address without consulting DNS. The external
/// resolver handles names; the core takes IP literals.
fn resolve_uri(uri: &Uri) -> Result<SocketAddr> {
    let host = uri.host.trim_start_matches('[').trim_end_matches(']');
    let ip: std::net::IpAddr = host
        .parse()
        .map_err(|_| Error::InvalidState(format!("unresolvable host: {}", uri.host)))?;
    Ok(SocketAddr::new(ip, uri.port_or_default()))
}
