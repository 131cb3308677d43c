//! The INVITE session state machine.
//!
//! One `InviteSession` rides on one dialog usage. Transitions are
//! driven by transaction events (fed in by the endpoint) and by
//! application calls; every transition fires
//! [`SessionEvent::StateChanged`].
//!
//! Contracts enforced here:
//! - Confirmed is only entered with offer/answer negotiation Done;
//!   otherwise the session sends BYE and disconnects with a
//!   488-equivalent cause.
//! - `end_session` before any response defers CANCEL via
//!   `pending_cancel`; the CANCEL goes out on the first provisional.
//! - A re-INVITE is refused with 500 while another INVITE transaction
//!   is pending in the dialog.
//! - The cause code only ever increases ("most informative wins").

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use waveline_dialog_core::transaction::TransactionKey;
use waveline_dialog_core::{Authenticator, Dialog, TimerSettings, TransactionManager};
use waveline_sip_core::negotiator::{NegotiatorState, SdpNegotiator};
use waveline_sip_core::sdp::{Direction, SessionDescription};
use waveline_sip_core::{
    Address, Header, HeaderAccess, HeaderName, HeaderValue, Message, Method, Request, Response,
    StatusCode, Via, ViaTransport,
};

use crate::errors::{Error, Result};
use crate::events::SessionEvent;
use crate::redirect::{RedirectAction, RedirectState};
use crate::transfer::{ReferSubscription, SipFrag, fill_refer, parse_notify};
use crate::types::{CallCause, CallState, MediaState, SessionId};

/// Commands the session engine posts back to the endpoint loop.
#[derive(Debug)]
pub(crate) enum EngineCommand {
    /// The UAS 2xx retransmission ladder ran out without an ACK.
    AckTimeout(SessionId),
}

/// Role of the session in the initial INVITE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Uac,
    Uas,
}

/// One call leg.
pub struct InviteSession {
    pub id: SessionId,
    pub role: Role,
    state: CallState,
    media_state: MediaState,
    dialog: Arc<Mutex<Dialog>>,
    negotiator: SdpNegotiator,
    cause: Option<CallCause>,
    /// CANCEL wanted but no provisional response seen yet.
    pending_cancel: bool,
    cancelling: bool,
    /// Pending INVITE client transaction (initial or re-INVITE).
    invite_tsx: Option<TransactionKey>,
    /// Server transaction of the INVITE we are answering (UAS).
    invite_server_tsx: Option<TransactionKey>,
    /// The INVITE we received (UAS) or sent (UAC).
    invite_request: Option<Request>,
    /// Last answer we sent on the pending INVITE; the retransmit
    /// ladder and CANCEL handling reuse it.
    last_answer: Option<Response>,
    retransmit_2xx: Option<JoinHandle<()>>,
    redirect: RedirectState,
    refer_subscription: Option<ReferSubscription>,
    authenticator: Authenticator,

    tm: Arc<TransactionManager>,
    events_tx: mpsc::Sender<SessionEvent>,
    engine_tx: mpsc::Sender<EngineCommand>,
    timers: TimerSettings,
    /// Host/port we stamp into Via headers.
    via_host: String,
    via_port: u16,
    local_contact: Address,
    remote_addr: SocketAddr,
}

impl InviteSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: SessionId,
        role: Role,
        dialog: Arc<Mutex<Dialog>>,
        tm: Arc<TransactionManager>,
        events_tx: mpsc::Sender<SessionEvent>,
        engine_tx: mpsc::Sender<EngineCommand>,
        timers: TimerSettings,
        via_host: String,
        via_port: u16,
        local_contact: Address,
        remote_addr: SocketAddr,
        authenticator: Authenticator,
    ) -> Self {
        InviteSession {
            id,
            role,
            state: CallState::Null,
            media_state: MediaState::None,
            dialog,
            negotiator: SdpNegotiator::new(),
            cause: None,
            pending_cancel: false,
            cancelling: false,
            invite_tsx: None,
            invite_server_tsx: None,
            invite_request: None,
            last_answer: None,
            retransmit_2xx: None,
            redirect: RedirectState::default(),
            refer_subscription: None,
            authenticator,
            tm,
            events_tx,
            engine_tx,
            timers,
            via_host,
            via_port,
            local_contact,
            remote_addr,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn media_state(&self) -> MediaState {
        self.media_state
    }

    pub fn cause(&self) -> Option<&CallCause> {
        self.cause.as_ref()
    }

    pub fn dialog(&self) -> Arc<Mutex<Dialog>> {
        self.dialog.clone()
    }

    /// Does this session own the given client transaction?
    pub(crate) fn owns_client_tsx(&self, key: &TransactionKey) -> bool {
        self.invite_tsx.as_ref() == Some(key)
    }

    /// Hard failure from below (transport error, transaction
    /// timeout): no messages can be sent, just record and disconnect.
    pub(crate) async fn fail_with_cause(&mut self, code: u16, reason: &str) {
        self.stop_2xx_retransmit();
        self.invite_tsx = None;
        self.set_cause(code, reason);
        self.set_state(CallState::Disconnected).await;
        let mut dialog = self.dialog.lock().await;
        dialog.dec_usage();
    }

    /// Monotonic cause update: a later, larger code wins; smaller
    /// codes never downgrade an existing cause.
    fn set_cause(&mut self, code: u16, reason: impl Into<String>) {
        let better = self.cause.as_ref().map(|c| code > c.code).unwrap_or(true);
        if better {
            self.cause = Some(CallCause::new(code, reason));
        }
    }

    async fn set_state(&mut self, new: CallState) {
        if self.state == new {
            return;
        }
        let previous = self.state;
        self.state = new;
        info!(session = %self.id, %previous, %new, "call state changed");
        let _ = self
            .events_tx
            .send(SessionEvent::StateChanged {
                session: self.id.clone(),
                previous,
                new,
                cause: self.cause.clone(),
            })
            .await;
    }

    fn via(&self) -> Header {
        Header::new(
            HeaderName::Via,
            HeaderValue::Via(Via::new(ViaTransport::Udp, self.via_host.clone(), Some(self.via_port))),
        )
    }

    /// Stamp Via onto an in-dialog request skeleton built by the
    /// dialog layer. The transaction layer fills the branch.
    fn finish_request(&self, mut request: Request) -> Request {
        let via = self.via();
        request.headers.insert(0, via);
        request
    }

    // ------------------------------------------------------------------
    // UAC
    // ------------------------------------------------------------------

    /// Send the initial INVITE. The request must already carry the
    /// dialog-forming headers; the offer rides as the body.
    pub(crate) async fn start_uac(
        &mut self,
        request: Request,
        offer: SessionDescription,
    ) -> Result<()> {
        if self.state != CallState::Null {
            return Err(Error::InvalidState(format!("start in {}", self.state)));
        }
        self.negotiator = SdpNegotiator::with_local_offer(offer)?;
        self.invite_request = Some(request.clone());
        let key = self.tm.send_request(request, self.remote_addr)?;
        self.invite_tsx = Some(key);
        self.set_state(CallState::Calling).await;
        Ok(())
    }

    /// 1xx on the INVITE client transaction.
    pub(crate) async fn on_provisional(&mut self, response: &Response) -> Result<()> {
        if self.pending_cancel {
            // The deferred CANCEL can go out now.
            if let Some(key) = &self.invite_tsx {
                debug!(session = %self.id, "sending deferred CANCEL");
                self.tm.send_cancel(key).await?;
            }
            self.pending_cancel = false;
            self.cancelling = true;
        }
        if response.status == StatusCode::Trying {
            return Ok(());
        }
        {
            let mut dialog = self.dialog.lock().await;
            dialog.on_uac_response(response)?;
        }
        if self.state == CallState::Calling && response.to_tag().is_some() {
            self.set_state(CallState::Early).await;
        }
        Ok(())
    }

    /// 2xx on an INVITE client transaction (initial or re-INVITE),
    /// including retransmitted 2xx arriving as strays.
    pub(crate) async fn on_invite_success(&mut self, response: &Response) -> Result<()> {
        let invite_seq = {
            let mut dialog = self.dialog.lock().await;
            dialog.on_uac_response(response)?;
            response.cseq().map(|c| c.seq).unwrap_or(1)
        };
        self.invite_tsx = None;

        // Feed the answer before the ACK so the ACK decision can
        // depend on the negotiation outcome.
        let neg_result = self.absorb_remote_answer(response).await;

        // ACK goes out whatever happened, so the peer stops
        // retransmitting the 2xx.
        let ack = {
            let dialog = self.dialog.lock().await;
            dialog.build_request(Method::Ack, invite_seq)
        };
        let ack = self.finish_request(ack);
        self.tm.send_stateless(&Message::Request(ack), self.remote_addr).await?;

        if self.state != CallState::Confirmed {
            self.set_state(CallState::Connecting).await;
        }
        match neg_result {
            Ok(()) => self.enter_confirmed().await,
            Err(e) => {
                warn!(session = %self.id, error = %e, "answer rejected");
                self.set_cause(StatusCode::NotAcceptableHere.as_u16(), "Not Acceptable Here");
                self.send_bye_and_disconnect().await
            }
        }
    }

    /// Feed the SDP in a 2xx (or ACK) into the negotiator and run it.
    async fn absorb_remote_answer(&mut self, message: &impl HeaderAccess) -> Result<()> {
        if self.negotiator.state() != NegotiatorState::LocalOffer {
            // Nothing outstanding (e.g. answer already seen in a
            // reliable provisional).
            return Ok(());
        }
        let body = message.body();
        if body.is_empty() {
            return Err(Error::Negotiation("answer missing from 2xx/ACK".to_string()));
        }
        let sdp: SessionDescription = std::str::from_utf8(body)
            .map_err(|_| Error::Negotiation("SDP is not UTF-8".to_string()))?
            .parse()
            .map_err(|e| Error::Negotiation(format!("unparseable SDP answer: {}", e)))?;
        self.negotiator.set_remote_answer(sdp)?;
        self.finish_negotiation().await
    }

    /// Run `negotiate()` and publish the outcome.
    async fn finish_negotiation(&mut self) -> Result<()> {
        let media =
            self.negotiator.negotiate().map_err(|e| Error::Negotiation(e.to_string()))?;
        self.update_media_state(&media.local, &media.remote).await;
        let _ = self
            .events_tx
            .send(SessionEvent::MediaUpdate { session: self.id.clone(), media })
            .await;
        Ok(())
    }

    /// Derive hold/active from the negotiated direction attributes.
    async fn update_media_state(
        &mut self,
        local: &SessionDescription,
        remote: &SessionDescription,
    ) {
        let local_dir =
            local.audio_media().map(|m| m.direction()).unwrap_or(Direction::Inactive);
        let remote_dir =
            remote.audio_media().map(|m| m.direction()).unwrap_or(Direction::Inactive);
        let remote_null = remote.connection.as_ref().map(|c| c.is_null_address()).unwrap_or(false);

        let new = match (local_dir, remote_dir) {
            (Direction::Inactive, _) | (_, Direction::Inactive) => MediaState::Inactive,
            (Direction::SendOnly, _) => MediaState::LocalHold,
            _ if remote_null => MediaState::RemoteHold,
            (_, Direction::SendOnly) => MediaState::RemoteHold,
            _ => MediaState::Active,
        };
        if new != self.media_state {
            self.media_state = new;
            let _ = self
                .events_tx
                .send(SessionEvent::MediaStateChanged { session: self.id.clone(), media: new })
                .await;
        }
    }

    /// 3xx/4xx/5xx/6xx on the INVITE client transaction.
    pub(crate) async fn on_invite_failure(
        &mut self,
        response: &Response,
        policy: &crate::redirect::RedirectPolicy,
    ) -> Result<()> {
        self.invite_tsx = None;

        // Authentication retry is recovered inside the dialog layer.
        if matches!(
            response.status,
            StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired
        ) && self.authenticator.has_credentials()
        {
            match self.retry_with_credentials(response).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(session = %self.id, error = %e, "authentication retry failed");
                }
            }
        }

        if response.status.is_redirection() {
            self.redirect.load(response);
            if !self.redirect.is_empty() {
                return self.follow_redirect(policy, response.status).await;
            }
        }

        self.set_cause(response.status.as_u16(), response.reason_phrase().to_string());
        self.set_state(CallState::Disconnected).await;
        Ok(())
    }

    /// Re-issue the INVITE with an Authorization header and a fresh
    /// CSeq.
    async fn retry_with_credentials(&mut self, response: &Response) -> Result<()> {
        let original = self
            .invite_request
            .clone()
            .ok_or_else(|| Error::InvalidState("no INVITE to retry".to_string()))?;
        let uri = original.uri.to_string();
        let auth_header =
            self.authenticator.answer_challenge(response, &Method::Invite, &uri)?;

        let mut retry = original;
        // Fresh transaction: new branch on the Via.
        if let Some(via_slot) = retry.headers.iter_mut().find(|h| h.name == HeaderName::Via) {
            if let HeaderValue::Via(via) = &mut via_slot.value {
                via.set_param("branch", Some(waveline_sip_core::generate_branch()));
            }
        }
        let next_seq = {
            let mut dialog = self.dialog.lock().await;
            dialog.local_cseq += 1;
            dialog.local_cseq
        };
        retry.set_header(Header::new(
            HeaderName::CSeq,
            HeaderValue::CSeq(waveline_sip_core::CSeq::new(next_seq, Method::Invite)),
        ));
        retry.remove_headers(&HeaderName::Authorization);
        retry.remove_headers(&HeaderName::ProxyAuthorization);
        retry.push_header(auth_header);

        // The negotiator still holds our offer; just resend.
        self.invite_request = Some(retry.clone());
        let key = self.tm.send_request(retry, self.remote_addr)?;
        self.invite_tsx = Some(key);
        debug!(session = %self.id, "INVITE re-issued with credentials");
        Ok(())
    }

    /// Walk redirect targets until the policy accepts, stops, or
    /// parks the decision.
    async fn follow_redirect(
        &mut self,
        policy: &crate::redirect::RedirectPolicy,
        status: StatusCode,
    ) -> Result<()> {
        while let Some(target) = self.redirect.pop_next() {
            match policy(&target) {
                RedirectAction::Accept => return self.try_redirect_target(target).await,
                RedirectAction::Reject => continue,
                RedirectAction::Pending => {
                    self.redirect.awaiting_decision = true;
                    let _ = self
                        .events_tx
                        .send(SessionEvent::RedirectPending {
                            session: self.id.clone(),
                            target,
                        })
                        .await;
                    return Ok(());
                }
                RedirectAction::Stop => break,
            }
        }
        self.set_cause(status.as_u16(), status.reason_phrase().to_string());
        self.set_state(CallState::Disconnected).await;
        Ok(())
    }

    /// Application decision for a parked redirect.
    pub(crate) async fn process_redirect(
        &mut self,
        accept: bool,
        policy: &crate::redirect::RedirectPolicy,
    ) -> Result<()> {
        if !self.redirect.awaiting_decision {
            return Err(Error::NoPendingRedirect);
        }
        self.redirect.awaiting_decision = false;
        if accept {
            let target = self
                .redirect
                .current()
                .cloned()
                .ok_or(Error::NoPendingRedirect)?;
            self.try_redirect_target(target).await
        } else {
            self.follow_redirect(policy, StatusCode::MovedTemporarily).await
        }
    }

    /// Point the INVITE at a redirect Contact and send it again.
    async fn try_redirect_target(&mut self, target: Address) -> Result<()> {
        let original = self
            .invite_request
            .clone()
            .ok_or_else(|| Error::InvalidState("no INVITE to redirect".to_string()))?;
        let mut retry = original;
        retry.uri = target.uri.clone();
        let mut to = target.clone();
        to.params.clear();
        retry.set_header(Header::new(HeaderName::To, HeaderValue::Address(to)));
        if let Some(via_slot) = retry.headers.iter_mut().find(|h| h.name == HeaderName::Via) {
            if let HeaderValue::Via(via) = &mut via_slot.value {
                via.set_param("branch", Some(waveline_sip_core::generate_branch()));
            }
        }
        let next_seq = {
            let mut dialog = self.dialog.lock().await;
            dialog.local_cseq += 1;
            dialog.remote_target = target.uri.clone();
            dialog.local_cseq
        };
        retry.set_header(Header::new(
            HeaderName::CSeq,
            HeaderValue::CSeq(waveline_sip_core::CSeq::new(next_seq, Method::Invite)),
        ));
        info!(session = %self.id, target = %target.uri, "following redirect");
        self.invite_request = Some(retry.clone());
        let key = self.tm.send_request(retry, self.remote_addr)?;
        self.invite_tsx = Some(key);
        Ok(())
    }

    // ------------------------------------------------------------------
    // UAS
    // ------------------------------------------------------------------

    /// Adopt a verified inbound INVITE.
    pub(crate) async fn start_uas(
        &mut self,
        request: Request,
        server_key: TransactionKey,
        offer: Option<SessionDescription>,
    ) -> Result<()> {
        if let Some(offer) = offer {
            self.negotiator = SdpNegotiator::with_remote_offer(offer)?;
        }
        self.invite_request = Some(request);
        self.invite_server_tsx = Some(server_key);
        self.set_state(CallState::Incoming).await;
        Ok(())
    }

    /// Answer the pending INVITE. For a 2xx, `sdp` is our media
    /// description: the answer template when the peer offered, or our
    /// offer when the INVITE had no body.
    pub(crate) async fn answer(
        &mut self,
        status: StatusCode,
        reason: Option<String>,
        sdp: Option<SessionDescription>,
    ) -> Result<()> {
        if !matches!(self.state, CallState::Incoming | CallState::Early) {
            return Err(Error::InvalidState(format!("answer in {}", self.state)));
        }
        let request = self
            .invite_request
            .clone()
            .ok_or_else(|| Error::InvalidState("no INVITE to answer".to_string()))?;
        let key = self
            .invite_server_tsx
            .clone()
            .ok_or_else(|| Error::InvalidState("INVITE transaction gone".to_string()))?;

        let mut response = match reason {
            Some(reason) => Response::new_with_reason(status, reason),
            None => Response::new(status),
        };
        for header in Response::for_request(status, &request).headers {
            response.headers.push(header);
        }
        // Our tag goes on the To.
        let local_tag = { self.dialog.lock().await.id.local_tag.clone() };
        if let Some(to_slot) = response.headers.iter_mut().find(|h| h.name == HeaderName::To) {
            if let HeaderValue::Address(to) = &mut to_slot.value {
                to.set_tag(local_tag);
            }
        }

        if status.is_success() {
            response.push_header(Header::new(
                HeaderName::Contact,
                HeaderValue::Address(self.local_contact.clone()),
            ));
            let answer_sdp = self.prepare_uas_sdp(sdp)?;
            if let Some(answer_sdp) = answer_sdp {
                response = response.with_body("application/sdp", answer_sdp.print());
            }
            self.last_answer = Some(response.clone());
            self.tm.send_response(&key, response.clone()).await?;
            { self.dialog.lock().await.confirm(); }
            self.start_2xx_retransmit(response);
            self.set_state(CallState::Connecting).await;
            if self.negotiator.state() == NegotiatorState::WaitNego {
                self.finish_negotiation().await?;
            }
        } else if status.is_provisional() {
            self.tm.send_response(&key, response.clone()).await?;
            self.last_answer = Some(response);
            if self.state == CallState::Incoming && status != StatusCode::Trying {
                self.set_state(CallState::Early).await;
            }
        } else {
            self.tm.send_response(&key, response).await?;
            self.set_cause(status.as_u16(), status.reason_phrase().to_string());
            self.set_state(CallState::Disconnected).await;
        }
        Ok(())
    }

    /// Work out the SDP body for a 2xx answer and drive the
    /// negotiator to the matching state.
    fn prepare_uas_sdp(
        &mut self,
        sdp: Option<SessionDescription>,
    ) -> Result<Option<SessionDescription>> {
        match self.negotiator.state() {
            NegotiatorState::RemoteOffer => {
                let template = sdp.ok_or_else(|| {
                    Error::Negotiation("2xx answer requires local SDP".to_string())
                })?;
                let answer = self
                    .negotiator
                    .build_answer(&template)
                    .map_err(|e| Error::Negotiation(e.to_string()))?;
                self.negotiator.set_local_answer(answer.clone())?;
                Ok(Some(answer))
            }
            NegotiatorState::Null => {
                // Offerless INVITE: we offer in the 2xx, the answer
                // arrives in the ACK.
                let offer = sdp.ok_or_else(|| {
                    Error::Negotiation("offerless INVITE requires local SDP".to_string())
                })?;
                self.negotiator.set_local_offer(offer.clone())?;
                Ok(Some(offer))
            }
            // Renegotiation handled elsewhere; nothing to attach.
            _ => Ok(None),
        }
    }

    /// Retransmit the 2xx on the T1..T2 ladder until ACK or 64*T1.
    fn start_2xx_retransmit(&mut self, response: Response) {
        self.stop_2xx_retransmit();
        let tm = self.tm.clone();
        let remote = self.remote_addr;
        let timers = self.timers.clone();
        let engine_tx = self.engine_tx.clone();
        let session = self.id.clone();
        self.retransmit_2xx = Some(tokio::spawn(async move {
            let deadline = Instant::now() + timers.transaction_timeout();
            let mut interval = timers.t1;
            loop {
                tokio::time::sleep(interval).await;
                if Instant::now() >= deadline {
                    let _ = engine_tx.send(EngineCommand::AckTimeout(session)).await;
                    break;
                }
                debug!(%session, "retransmitting 2xx while awaiting ACK");
                let _ = tm.send_stateless(&Message::Response(response.clone()), remote).await;
                interval = timers.next_retransmit(interval);
            }
        }));
    }

    fn stop_2xx_retransmit(&mut self) {
        if let Some(handle) = self.retransmit_2xx.take() {
            handle.abort();
        }
    }

    /// ACK arrived for our 2xx (stray ACK routed by dialog) or for a
    /// non-2xx final (transaction event).
    pub(crate) async fn on_ack(&mut self, request: &Request) -> Result<()> {
        self.stop_2xx_retransmit();
        self.invite_server_tsx = None;

        // Late answer in the ACK body.
        if self.negotiator.state() == NegotiatorState::LocalOffer && !request.body.is_empty() {
            if let Err(e) = self.absorb_remote_answer(request).await {
                warn!(session = %self.id, error = %e, "ACK carried a bad answer");
            }
        }

        // Only Connecting promotes on ACK; retransmitted ACKs after a
        // non-2xx must not confirm anything.
        if self.state == CallState::Connecting {
            self.enter_confirmed().await?;
        }
        Ok(())
    }

    /// The ladder ran dry: the peer never ACKed our 2xx.
    pub(crate) async fn on_ack_timeout(&mut self) -> Result<()> {
        warn!(session = %self.id, "ACK never arrived, terminating dialog");
        self.set_cause(StatusCode::RequestTimeout.as_u16(), "ACK timeout");
        self.send_bye_and_disconnect().await
    }

    /// Entering Confirmed demands a completed negotiation.
    async fn enter_confirmed(&mut self) -> Result<()> {
        if self.negotiator.state() != NegotiatorState::Done {
            warn!(session = %self.id, "offer/answer incomplete, ending the session");
            self.set_cause(
                StatusCode::NotAcceptableHere.as_u16(),
                "SDP offer/answer incomplete",
            );
            return self.send_bye_and_disconnect().await;
        }
        self.set_state(CallState::Confirmed).await;
        Ok(())
    }

    /// CANCEL matched our pending INVITE server transaction.
    pub(crate) async fn on_cancel(&mut self) -> Result<()> {
        if self.state.is_established() || self.state == CallState::Disconnected {
            // Too late; the CANCEL changes nothing.
            return Ok(());
        }
        // A CANCEL racing our own final answer also loses.
        if self.last_answer.as_ref().map(|r| r.status.is_final()).unwrap_or(false) {
            return Ok(());
        }
        if let Some(key) = self.invite_server_tsx.clone() {
            let request = self.invite_request.clone().unwrap_or_else(|| {
                Request::new(Method::Invite, "sip:invalid".parse().unwrap())
            });
            let mut response =
                Response::for_request(StatusCode::RequestTerminated, &request);
            let local_tag = { self.dialog.lock().await.id.local_tag.clone() };
            if let Some(to_slot) = response.headers.iter_mut().find(|h| h.name == HeaderName::To)
            {
                if let HeaderValue::Address(to) = &mut to_slot.value {
                    to.set_tag(local_tag);
                }
            }
            self.tm.send_response(&key, response).await?;
        }
        self.set_cause(
            StatusCode::RequestTerminated.as_u16(),
            "Request Terminated",
        );
        self.set_state(CallState::Disconnected).await;
        Ok(())
    }

    /// BYE inside the dialog.
    pub(crate) async fn on_bye(&mut self, server_key: &TransactionKey, request: &Request) -> Result<()> {
        self.stop_2xx_retransmit();
        let response = Response::for_request(StatusCode::Ok, request);
        self.tm.send_response(server_key, response).await?;
        self.set_cause(StatusCode::Ok.as_u16(), "Normal call clearing");
        self.set_state(CallState::Disconnected).await;
        let mut dialog = self.dialog.lock().await;
        dialog.dec_usage();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Session control
    // ------------------------------------------------------------------

    /// Hang up / reject / cancel, depending on state (the single
    /// teardown entry point).
    pub(crate) async fn end_session(&mut self, code: u16, reason: Option<String>) -> Result<()> {
        let reason_text =
            reason.unwrap_or_else(|| match StatusCode::from_u16(code) {
                Ok(s) => s.reason_phrase().to_string(),
                Err(_) => "Terminated".to_string(),
            });
        self.set_cause(code, reason_text.clone());

        match self.state {
            CallState::Null => {
                self.set_state(CallState::Disconnected).await;
                Ok(())
            }
            CallState::Calling | CallState::Early if self.role == Role::Uac => {
                if self.cancelling || self.pending_cancel {
                    // Already tearing down.
                    return Ok(());
                }
                let Some(key) = self.invite_tsx.clone() else {
                    self.set_state(CallState::Disconnected).await;
                    return Ok(());
                };
                match self.tm.send_cancel(&key).await {
                    Ok(_) => {
                        self.cancelling = true;
                        Ok(())
                    }
                    Err(_) => {
                        // No provisional yet: defer until one arrives.
                        debug!(session = %self.id, "delaying CANCEL until a provisional response");
                        self.pending_cancel = true;
                        Ok(())
                    }
                }
            }
            CallState::Incoming | CallState::Early => {
                let status =
                    StatusCode::from_u16(code).unwrap_or(StatusCode::Decline);
                let status = if status.is_error() { status } else { StatusCode::Decline };
                self.answer(status, Some(reason_text), None).await
            }
            CallState::Connecting | CallState::Confirmed => self.send_bye_and_disconnect().await,
            CallState::Disconnected => Ok(()),
            _ => {
                self.set_state(CallState::Disconnected).await;
                Ok(())
            }
        }
    }

    async fn send_bye_and_disconnect(&mut self) -> Result<()> {
        self.stop_2xx_retransmit();
        let bye = {
            let mut dialog = self.dialog.lock().await;
            dialog.next_request(Method::Bye)
        };
        let bye = self.finish_request(bye);
        if let Err(e) = self.tm.send_request(bye, self.remote_addr) {
            warn!(session = %self.id, error = %e, "BYE could not be sent");
        }
        if self.cause.is_none() {
            self.set_cause(StatusCode::Ok.as_u16(), "Normal call clearing");
        }
        self.set_state(CallState::Disconnected).await;
        let mut dialog = self.dialog.lock().await;
        dialog.dec_usage();
        Ok(())
    }

    /// Send a re-INVITE carrying a new offer (hold, codec change...).
    pub(crate) async fn reinvite(&mut self, offer: SessionDescription) -> Result<()> {
        if self.state != CallState::Confirmed {
            return Err(Error::InvalidState(format!("re-INVITE in {}", self.state)));
        }
        if self.invite_tsx.is_some() {
            return Err(Error::InvitePending);
        }
        self.negotiator.set_local_offer(offer.clone())?;
        let request = {
            let mut dialog = self.dialog.lock().await;
            dialog.next_request(Method::Invite)
        };
        let request =
            self.finish_request(request).with_body("application/sdp", offer.print());
        self.invite_request = Some(request.clone());
        let key = self.tm.send_request(request, self.remote_addr)?;
        self.invite_tsx = Some(key);
        Ok(())
    }

    /// Convenience hold/unhold built on `reinvite`.
    pub(crate) async fn set_hold(&mut self, hold: bool) -> Result<()> {
        let mut offer = self
            .negotiator
            .active()
            .map(|m| m.local)
            .ok_or_else(|| Error::InvalidState("no active media to modify".to_string()))?;
        if let Some(audio) = offer.audio_media_mut() {
            audio.set_direction(if hold { Direction::SendOnly } else { Direction::SendRecv });
        }
        offer.origin.sess_version += 1;
        self.reinvite(offer).await
    }

    /// Inbound re-INVITE on a confirmed session. Auto-answers with
    /// the active media, honouring hold requests.
    pub(crate) async fn on_reinvite(
        &mut self,
        request: &Request,
        server_key: TransactionKey,
    ) -> Result<()> {
        if self.invite_tsx.is_some() || self.invite_server_tsx.is_some() {
            let mut response = Response::for_request(StatusCode::ServerInternalError, request);
            response.reason = Some("Another INVITE transaction in progress".to_string());
            self.tm.send_response(&server_key, response).await?;
            return Ok(());
        }

        let offer: SessionDescription = match std::str::from_utf8(&request.body)
            .ok()
            .and_then(|s| s.parse().ok())
        {
            Some(sdp) => sdp,
            None => {
                let response =
                    Response::for_request(StatusCode::NotAcceptableHere, request);
                self.tm.send_response(&server_key, response).await?;
                return Ok(());
            }
        };

        let template = match self.negotiator.active() {
            Some(media) => media.local,
            None => {
                let response =
                    Response::for_request(StatusCode::NotAcceptableHere, request);
                self.tm.send_response(&server_key, response).await?;
                return Ok(());
            }
        };

        self.negotiator.set_remote_offer(offer)?;
        let answer = match self.negotiator.build_answer(&template) {
            Ok(answer) => answer,
            Err(e) => {
                warn!(session = %self.id, error = %e, "re-INVITE offer unacceptable");
                let response =
                    Response::for_request(StatusCode::NotAcceptableHere, request);
                self.tm.send_response(&server_key, response).await?;
                return Ok(());
            }
        };
        self.negotiator.set_local_answer(answer.clone())?;
        self.finish_negotiation().await?;

        let mut response = Response::for_request(StatusCode::Ok, request);
        let local_tag = { self.dialog.lock().await.id.local_tag.clone() };
        if let Some(to_slot) = response.headers.iter_mut().find(|h| h.name == HeaderName::To) {
            if let HeaderValue::Address(to) = &mut to_slot.value {
                to.set_tag(local_tag);
            }
        }
        response.push_header(Header::new(
            HeaderName::Contact,
            HeaderValue::Address(self.local_contact.clone()),
        ));
        let response = response.with_body("application/sdp", answer.print());
        self.invite_server_tsx = Some(server_key.clone());
        self.last_answer = Some(response.clone());
        self.tm.send_response(&server_key, response.clone()).await?;
        self.start_2xx_retransmit(response);
        Ok(())
    }

    /// UPDATE (RFC 3311): offer/answer without touching call state.
    /// The non-INVITE server transaction handles retransmission, so
    /// no 2xx ladder here.
    pub(crate) async fn on_update(
        &mut self,
        request: &Request,
        server_key: &TransactionKey,
    ) -> Result<()> {
        if request.body.is_empty() {
            let response = Response::for_request(StatusCode::Ok, request);
            return self.tm.send_response(server_key, response).await.map_err(Into::into);
        }
        let offer: Option<SessionDescription> =
            std::str::from_utf8(&request.body).ok().and_then(|s| s.parse().ok());
        let (Some(offer), Some(active)) = (offer, self.negotiator.active()) else {
            let response = Response::for_request(StatusCode::NotAcceptableHere, request);
            return self.tm.send_response(server_key, response).await.map_err(Into::into);
        };
        self.negotiator.set_remote_offer(offer)?;
        let answer = match self.negotiator.build_answer(&active.local) {
            Ok(answer) => answer,
            Err(_) => {
                let response =
                    Response::for_request(StatusCode::NotAcceptableHere, request);
                return self.tm.send_response(server_key, response).await.map_err(Into::into);
            }
        };
        self.negotiator.set_local_answer(answer.clone())?;
        self.finish_negotiation().await?;
        let response = Response::for_request(StatusCode::Ok, request)
            .with_body("application/sdp", answer.print());
        self.tm.send_response(server_key, response).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transfer
    // ------------------------------------------------------------------

    /// Send REFER asking the peer to call `target`.
    pub(crate) async fn refer(&mut self, target: &Address) -> Result<()> {
        if self.state != CallState::Confirmed {
            return Err(Error::InvalidState(format!("REFER in {}", self.state)));
        }
        let refer = {
            let mut dialog = self.dialog.lock().await;
            dialog.next_request(Method::Refer)
        };
        let refer = fill_refer(self.finish_request(refer), target);
        self.tm.send_request(refer, self.remote_addr)?;
        Ok(())
    }

    /// Inbound REFER: accept with 202, open the implicit
    /// subscription, emit the initial NOTIFY.
    pub(crate) async fn on_refer(
        &mut self,
        request: &Request,
        server_key: &TransactionKey,
    ) -> Result<Address> {
        let mut subscription = ReferSubscription::from_refer(request)?;
        let refer_to = subscription.refer_to.clone();

        let response = Response::for_request(StatusCode::Accepted, request);
        self.tm.send_response(server_key, response).await?;

        let notify = {
            let mut dialog = self.dialog.lock().await;
            dialog.inc_usage();
            dialog.next_request(Method::Notify)
        };
        let notify = subscription.fill_notify(self.finish_request(notify), &SipFrag::trying());
        self.tm.send_request(notify, self.remote_addr)?;
        self.refer_subscription = Some(subscription);
        Ok(refer_to)
    }

    /// Push transfer progress to the referrer. Terminal status closes
    /// the subscription without touching the call.
    pub(crate) async fn notify_transfer(&mut self, status: u16, reason: &str) -> Result<()> {
        let notify = {
            let mut dialog = self.dialog.lock().await;
            dialog.next_request(Method::Notify)
        };
        let notify = self.finish_request(notify);
        let subscription = self
            .refer_subscription
            .as_mut()
            .ok_or_else(|| Error::InvalidState("no refer subscription".to_string()))?;
        let frag = SipFrag::new(status, reason);
        let terminal = frag.is_final();
        let notify = subscription.fill_notify(notify, &frag);
        self.tm.send_request(notify, self.remote_addr)?;
        if terminal {
            self.refer_subscription = None;
            let mut dialog = self.dialog.lock().await;
            dialog.dec_usage();
        }
        Ok(())
    }

    /// Inbound NOTIFY on the refer subscription.
    pub(crate) async fn on_notify(
        &mut self,
        request: &Request,
        server_key: &TransactionKey,
    ) -> Result<()> {
        match parse_notify(request) {
            Ok((frag, terminated)) => {
                let response = Response::for_request(StatusCode::Ok, request);
                self.tm.send_response(server_key, response).await?;
                let _ = self
                    .events_tx
                    .send(SessionEvent::TransferProgress {
                        session: self.id.clone(),
                        status: frag.status,
                        reason: frag.reason,
                        terminated,
                    })
                    .await;
            }
            Err(_) => {
                let response =
                    Response::for_request(StatusCode::BadRequest, request);
                self.tm.send_response(server_key, response).await?;
            }
        }
        Ok(())
    }
}

impl Drop for InviteSession {
    fn drop(&mut self) {
        self.stop_2xx_retransmit();
    }
}
