//! The ICE session: checklist construction, paced connectivity
//! checks, triggered checks, nomination and keepalive (RFC 5245
//! subset).
//!
//! The session does no socket I/O. Outgoing packets are queued on a
//! channel (they share the media transport); the embedder feeds
//! inbound STUN packets to [`IceSession::handle_packet`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, trace, warn};

use crate::candidate::{Candidate, CandidateType, compute_priority, pair_priority};
use crate::error::{Error, Result};
use crate::stun::{
    StunAttribute, StunAttributeType, StunMessage, StunMessageType, short_term_key,
};

/// Default pacing interval between ordinary checks.
pub const DEFAULT_TA: Duration = Duration::from_millis(20);

/// Keepalive interval on the nominated pair.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(15);

/// STUN error code for role conflicts (RFC 5245 §7.2.1.1).
const ROLE_CONFLICT: u16 = 487;

/// Agent role, fixed at session creation (conflicts may flip it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceRole {
    Controlling,
    Controlled,
}

/// Connectivity check state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Frozen,
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

impl CheckState {
    fn is_terminal(&self) -> bool {
        matches!(self, CheckState::Succeeded | CheckState::Failed)
    }
}

/// One candidate pair under test.
#[derive(Debug, Clone)]
pub struct Check {
    pub local: usize,
    pub remote: usize,
    /// Pair foundation `"local:remote"`, drives unfreezing.
    pub foundation: String,
    pub priority: u64,
    pub state: CheckState,
    pub nominated: bool,
    pub err_code: Option<u16>,
    txid: Option<[u8; 12]>,
    sent_at: Option<Instant>,
    retransmits: u32,
}

/// Session events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceEvent {
    /// A check succeeded and entered the valid list.
    CheckSucceeded { component: u8, local: SocketAddr, remote: SocketAddr },
    /// The nominated pair for a component changed.
    NominationUpdated { component: u8 },
    /// Every component has a nomination (success) or every check is
    /// dead with none (failure). Fires once.
    Completed { success: bool },
}

/// A packet the embedder must put on the wire.
#[derive(Debug)]
pub struct OutboundPacket {
    pub component: u8,
    pub data: Bytes,
    pub dest: SocketAddr,
}

/// Tunables.
#[derive(Debug, Clone)]
pub struct IceConfig {
    /// Pacing interval Ta.
    pub check_interval: Duration,
    /// Retransmission timeout for an in-progress check.
    pub rto: Duration,
    /// Retransmissions before a check fails.
    pub max_retransmits: u32,
    pub keepalive_interval: Duration,
}

impl Default for IceConfig {
    fn default() -> Self {
        IceConfig {
            check_interval: DEFAULT_TA,
            rto: Duration::from_millis(100),
            max_retransmits: 6,
            keepalive_interval: DEFAULT_KEEPALIVE,
        }
    }
}

struct Inner {
    role: IceRole,
    tie_breaker: u64,
    components: u8,
    local_ufrag: String,
    local_pwd: String,
    remote_ufrag: Option<String>,
    remote_pwd: Option<String>,
    local_cands: Vec<Candidate>,
    remote_cands: Vec<Candidate>,
    checks: Vec<Check>,
    /// Indices of succeeded checks, kept sorted by priority.
    valid: Vec<usize>,
    /// Component id → check index of the nominated check.
    nominated: HashMap<u8, usize>,
    completed: Option<bool>,
    last_keepalive: Instant,
    config: IceConfig,
    packet_tx: mpsc::Sender<OutboundPacket>,
    events_tx: mpsc::Sender<IceEvent>,
    running: bool,
}

/// One ICE session per media transport.
#[derive(Clone)]
pub struct IceSession {
    inner: Arc<Mutex<Inner>>,
}

impl IceSession {
    /// Create a session. Returns the event stream and the outbound
    /// packet queue the embedder must drain onto the media socket.
    pub fn new(
        role: IceRole,
        components: u8,
        config: IceConfig,
    ) -> (IceSession, mpsc::Receiver<IceEvent>, mpsc::Receiver<OutboundPacket>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (packet_tx, packet_rx) = mpsc::channel(256);
        let inner = Inner {
            role,
            tie_breaker: rand::random(),
            components: components.max(1),
            local_ufrag: random_token(8),
            local_pwd: random_token(24),
            remote_ufrag: None,
            remote_pwd: None,
            local_cands: Vec::new(),
            remote_cands: Vec::new(),
            checks: Vec::new(),
            valid: Vec::new(),
            nominated: HashMap::new(),
            completed: None,
            last_keepalive: Instant::now(),
            config,
            packet_tx,
            events_tx,
            running: false,
        };
        (IceSession { inner: Arc::new(Mutex::new(inner)) }, events_rx, packet_rx)
    }

    /// Local ufrag and password for SDP.
    pub async fn credentials(&self) -> (String, String) {
        let inner = self.inner.lock().await;
        (inner.local_ufrag.clone(), inner.local_pwd.clone())
    }

    pub async fn role(&self) -> IceRole {
        self.inner.lock().await.role
    }

    /// Add a local host candidate.
    pub async fn add_host_candidate(&self, component: u8, addr: SocketAddr) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.remote_pwd.is_some() {
            return Err(Error::InvalidState(
                "cannot add local candidates after the checklist is built".to_string(),
            ));
        }
        let candidate = Candidate::host(component, addr)?;
        debug!(%candidate, "local candidate added");
        inner.local_cands.push(candidate);
        Ok(())
    }

    pub async fn local_candidates(&self) -> Vec<Candidate> {
        self.inner.lock().await.local_cands.clone()
    }

    /// Install the remote credentials and candidate list, building
    /// the checklist.
    pub async fn set_remote(
        &self,
        ufrag: impl Into<String>,
        pwd: impl Into<String>,
        candidates: Vec<Candidate>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.remote_ufrag = Some(ufrag.into());
        inner.remote_pwd = Some(pwd.into());
        inner.remote_cands = candidates;
        inner.build_checklist()?;
        Ok(())
    }

    /// Start the paced check scheduler.
    pub async fn start(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.remote_pwd.is_none() {
                return Err(Error::InvalidState("remote credentials not set".to_string()));
            }
            if inner.running {
                return Ok(());
            }
            inner.running = true;
        }
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                let interval = {
                    let mut inner = session.inner.lock().await;
                    if !inner.running {
                        break;
                    }
                    inner.tick().await;
                    inner.config.check_interval
                };
                tokio::time::sleep(interval).await;
            }
            trace!("check scheduler stopped");
        });
        Ok(())
    }

    /// Stop scheduling; the session keeps answering inbound checks.
    pub async fn stop(&self) {
        self.inner.lock().await.running = false;
    }

    /// Feed one inbound STUN packet from the media socket.
    pub async fn handle_packet(
        &self,
        data: &[u8],
        source: SocketAddr,
        component: u8,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let message = StunMessage::decode(data)?;
        match message.msg_type {
            StunMessageType::BindingRequest => {
                // Requests to us are keyed with our password.
                let key = short_term_key(&inner.local_pwd);
                if let Err(e) = StunMessage::decode_with_key(data, &key) {
                    warn!(%source, "binding request failed integrity, dropping");
                    return Err(e);
                }
                inner.on_binding_request(message, source, component).await
            }
            StunMessageType::BindingResponse | StunMessageType::BindingErrorResponse => {
                inner.on_binding_response(message, source).await
            }
            StunMessageType::BindingIndication => Ok(()),
            StunMessageType::Other(t) => {
                trace!(msg_type = t, "ignoring unhandled STUN message");
                Ok(())
            }
        }
    }

    /// Send application data on the nominated pair of a component.
    pub async fn send_data(&self, component: u8, payload: Bytes) -> Result<()> {
        let inner = self.inner.lock().await;
        let check_idx = inner
            .nominated
            .get(&component)
            .copied()
            .ok_or_else(|| Error::InvalidState("no nominated pair".to_string()))?;
        let dest = inner.remote_cands[inner.checks[check_idx].remote].addr;
        inner
            .packet_tx
            .send(OutboundPacket { component, data: payload, dest })
            .await
            .map_err(|_| Error::InvalidState("packet queue closed".to_string()))
    }

    /// The nominated (local, remote) pair for a component.
    pub async fn nominated_pair(&self, component: u8) -> Option<(Candidate, Candidate)> {
        let inner = self.inner.lock().await;
        let check = inner.nominated.get(&component).map(|i| &inner.checks[*i])?;
        Some((
            inner.local_cands[check.local].clone(),
            inner.remote_cands[check.remote].clone(),
        ))
    }

    /// `Some(true)` success, `Some(false)` failure, `None` still
    /// running.
    pub async fn completion(&self) -> Option<bool> {
        self.inner.lock().await.completed
    }

    /// Snapshot of the checklist (diagnostics and tests).
    pub async fn checks(&self) -> Vec<Check> {
        self.inner.lock().await.checks.clone()
    }
}

impl Inner {
    /// Build the checklist (RFC 5245 §5.7): pair same-component,
    /// same-family candidates; fold server-reflexive locals onto
    /// their base; sort by pair priority; unfreeze the head plus one
    /// check per (component, foundation).
    fn build_checklist(&mut self) -> Result<()> {
        self.checks.clear();
        self.valid.clear();

        for (li, local) in self.local_cands.iter().enumerate() {
            for (ri, remote) in self.remote_cands.iter().enumerate() {
                if local.component != remote.component || local.family() != remote.family() {
                    continue;
                }
                let (o, a) = match self.role {
                    IceRole::Controlling => (local.priority, remote.priority),
                    IceRole::Controlled => (remote.priority, local.priority),
                };
                self.checks.push(Check {
                    local: li,
                    remote: ri,
                    foundation: format!("{}:{}", local.foundation, remote.foundation),
                    priority: pair_priority(o, a),
                    state: CheckState::Frozen,
                    nominated: false,
                    err_code: None,
                    txid: None,
                    sent_at: None,
                    retransmits: 0,
                });
            }
        }

        // Server-reflexive locals are redundant with their base for
        // checking; fold and dedup (RFC 5245 §5.7.3).
        for check in &mut self.checks {
            if self.local_cands[check.local].kind == CandidateType::ServerReflexive {
                let base = self.local_cands[check.local].base_addr;
                if let Some(base_idx) =
                    self.local_cands.iter().position(|c| c.addr == base && c.kind == CandidateType::Host)
                {
                    check.local = base_idx;
                }
            }
        }
        self.checks.sort_by(|a, b| b.priority.cmp(&a.priority));
        self.checks.dedup_by(|a, b| a.local == b.local && a.remote == b.remote);

        if self.checks.is_empty() {
            return Err(Error::Ice("checklist is empty".to_string()));
        }

        // Head goes to Waiting; so does the best check of every other
        // (component, foundation) group.
        self.checks[0].state = CheckState::Waiting;
        let head_component = self.local_cands[self.checks[0].local].component;
        let head_foundation = self.checks[0].foundation.clone();
        let mut unfrozen: Vec<(u8, String)> = vec![(head_component, head_foundation)];
        for check in self.checks.iter_mut().skip(1) {
            let component = self.local_cands[check.local].component;
            let seen = unfrozen
                .iter()
                .any(|(c, f)| *c == component && *f == check.foundation);
            if !seen {
                check.state = CheckState::Waiting;
                unfrozen.push((component, check.foundation.clone()));
            }
        }
        debug!(checks = self.checks.len(), "checklist built");
        Ok(())
    }

    /// One scheduler tick: age in-progress checks, send the next
    /// ordinary check, keepalive, detect failure.
    async fn tick(&mut self) {
        self.age_in_progress().await;

        // Highest-priority Waiting check, else unfreeze the best
        // Frozen one.
        let next = self
            .checks
            .iter()
            .position(|c| c.state == CheckState::Waiting)
            .or_else(|| self.checks.iter().position(|c| c.state == CheckState::Frozen));
        if let Some(idx) = next {
            let nominate = self.role == IceRole::Controlling;
            if let Err(e) = self.send_check(idx, nominate).await {
                warn!(error = %e, "check send failed");
                self.checks[idx].state = CheckState::Failed;
            }
        }

        self.keepalive().await;
        self.check_doom();
    }

    async fn age_in_progress(&mut self) {
        let now = Instant::now();
        let rto = self.config.rto;
        let max_retransmits = self.config.max_retransmits;
        let mut to_resend = Vec::new();
        for (idx, check) in self.checks.iter_mut().enumerate() {
            if check.state != CheckState::InProgress {
                continue;
            }
            let Some(sent_at) = check.sent_at else { continue };
            if now.duration_since(sent_at) < rto {
                continue;
            }
            if check.retransmits >= max_retransmits {
                debug!(idx, "check timed out");
                check.state = CheckState::Failed;
                check.err_code = Some(408);
            } else {
                check.retransmits += 1;
                to_resend.push(idx);
            }
        }
        for idx in to_resend {
            let nominate = self.checks[idx].nominated || self.role == IceRole::Controlling;
            if let Err(e) = self.send_check(idx, nominate).await {
                warn!(error = %e, "check retransmit failed");
                self.checks[idx].state = CheckState::Failed;
            }
        }
    }

    /// Send a Binding Request for one check and mark it InProgress.
    async fn send_check(&mut self, idx: usize, nominate: bool) -> Result<()> {
        let (remote_ufrag, remote_pwd) = match (&self.remote_ufrag, &self.remote_pwd) {
            (Some(u), Some(p)) => (u.clone(), p.clone()),
            _ => return Err(Error::InvalidState("remote credentials not set".to_string())),
        };
        let local = self.local_cands[self.checks[idx].local].clone();
        let remote_addr = self.remote_cands[self.checks[idx].remote].addr;

        let mut request = StunMessage::binding_request();
        request.add_attribute(StunAttribute::username(&format!(
            "{}:{}",
            remote_ufrag, self.local_ufrag
        )));
        // PRIORITY carries what our candidate would score as
        // peer-reflexive (RFC 5245 §7.1.2.1).
        request.add_attribute(StunAttribute::priority(compute_priority(
            CandidateType::PeerReflexive,
            65535,
            local.component,
        )));
        match self.role {
            IceRole::Controlling => {
                request.add_attribute(StunAttribute::ice_controlling(self.tie_breaker));
                if nominate {
                    request.add_attribute(StunAttribute::use_candidate());
                    self.checks[idx].nominated = true;
                }
            }
            IceRole::Controlled => {
                request.add_attribute(StunAttribute::ice_controlled(self.tie_breaker));
            }
        }

        let wire = request.encode_with(Some(&short_term_key(&remote_pwd)), true);
        self.checks[idx].txid = Some(request.transaction_id);
        self.checks[idx].sent_at = Some(Instant::now());
        if self.checks[idx].state != CheckState::InProgress {
            self.checks[idx].state = CheckState::InProgress;
        }
        trace!(idx, %remote_addr, "connectivity check sent");
        self.packet_tx
            .send(OutboundPacket { component: local.component, data: wire, dest: remote_addr })
            .await
            .map_err(|_| Error::InvalidState("packet queue closed".to_string()))
    }

    /// Success or error response to one of our checks.
    async fn on_binding_response(
        &mut self,
        message: StunMessage,
        source: SocketAddr,
    ) -> Result<()> {
        let Some(idx) = self
            .checks
            .iter()
            .position(|c| c.txid.as_ref() == Some(&message.transaction_id))
        else {
            trace!(%source, "response matches no check");
            return Ok(());
        };

        if message.msg_type.is_error_response() {
            let code = message
                .attribute(StunAttributeType::ErrorCode)
                .and_then(|a| a.as_error_code().ok())
                .map(|(code, _)| code)
                .unwrap_or(500);
            if code == ROLE_CONFLICT {
                // Flip the role and retry the check (RFC 5245
                // §7.1.3.1).
                self.role = match self.role {
                    IceRole::Controlling => IceRole::Controlled,
                    IceRole::Controlled => IceRole::Controlling,
                };
                info!(role = ?self.role, "role conflict, switching");
                self.checks[idx].state = CheckState::Waiting;
                self.checks[idx].txid = None;
                return Ok(());
            }
            debug!(idx, code, "check failed");
            self.checks[idx].state = CheckState::Failed;
            self.checks[idx].err_code = Some(code);
            self.check_doom();
            return Ok(());
        }

        // Success: learn peer-reflexive local candidates from the
        // mapped address.
        if let Some(mapped) = message
            .attribute(StunAttributeType::XorMappedAddress)
            .and_then(|a| a.as_socket_addr(&message.transaction_id).ok())
        {
            let known = self.local_cands.iter().position(|c| c.addr == mapped);
            let local_idx = match known {
                Some(i) => i,
                None => {
                    let base = self.local_cands[self.checks[idx].local].clone();
                    let prflx = Candidate::peer_reflexive(
                        base.component,
                        mapped,
                        base.base_addr,
                        compute_priority(CandidateType::PeerReflexive, 65534, base.component),
                    );
                    info!(%prflx, "discovered peer-reflexive local candidate");
                    self.local_cands.push(prflx);
                    self.local_cands.len() - 1
                }
            };
            self.checks[idx].local = local_idx;
        }

        self.checks[idx].state = CheckState::Succeeded;
        let component = self.local_cands[self.checks[idx].local].component;
        let local_addr = self.local_cands[self.checks[idx].local].addr;
        let remote_addr = self.remote_cands[self.checks[idx].remote].addr;
        debug!(idx, component, %remote_addr, "check succeeded");

        self.valid.push(idx);
        let priorities: Vec<u64> = self.checks.iter().map(|c| c.priority).collect();
        self.valid.sort_by(|a, b| priorities[*b].cmp(&priorities[*a]));

        let _ = self
            .events_tx
            .send(IceEvent::CheckSucceeded { component, local: local_addr, remote: remote_addr })
            .await;

        // Component 1 success unfreezes same-foundation checks in
        // other components.
        if component == 1 {
            let foundation = self.checks[idx].foundation.clone();
            for other in self.checks.iter_mut() {
                if other.state == CheckState::Frozen && other.foundation == foundation {
                    other.state = CheckState::Waiting;
                }
            }
        }

        if self.checks[idx].nominated {
            self.nominate(component, idx).await;
        }
        self.check_completion().await;
        Ok(())
    }

    /// Inbound Binding Request: answer it, learn peer-reflexive
    /// remote candidates, run a triggered check, honour
    /// USE-CANDIDATE.
    async fn on_binding_request(
        &mut self,
        message: StunMessage,
        source: SocketAddr,
        component: u8,
    ) -> Result<()> {
        // Role conflict handling (RFC 5245 §7.2.1.1).
        if let Some(their_tb) = message
            .attribute(StunAttributeType::IceControlling)
            .and_then(|a| a.as_u64().ok())
        {
            if self.role == IceRole::Controlling {
                if self.tie_breaker >= their_tb {
                    let response =
                        StunMessage::binding_error(message.transaction_id, ROLE_CONFLICT, "Role Conflict");
                    let wire = response
                        .encode_with(Some(&short_term_key(&self.local_pwd)), true);
                    let _ = self
                        .packet_tx
                        .send(OutboundPacket { component, data: wire, dest: source })
                        .await;
                    return Ok(());
                }
                info!("role conflict, becoming controlled");
                self.role = IceRole::Controlled;
            }
        }
        if let Some(their_tb) = message
            .attribute(StunAttributeType::IceControlled)
            .and_then(|a| a.as_u64().ok())
        {
            if self.role == IceRole::Controlled {
                // Both controlled: the higher tie-breaker takes over,
                // the lower one sends 487 (RFC 5245 §7.2.1.1).
                if self.tie_breaker >= their_tb {
                    info!("role conflict, becoming controlling");
                    self.role = IceRole::Controlling;
                } else {
                    let response = StunMessage::binding_error(
                        message.transaction_id,
                        ROLE_CONFLICT,
                        "Role Conflict",
                    );
                    let wire =
                        response.encode_with(Some(&short_term_key(&self.local_pwd)), true);
                    let _ = self
                        .packet_tx
                        .send(OutboundPacket { component, data: wire, dest: source })
                        .await;
                    return Ok(());
                }
            }
        }

        // Answer with the source the request came from.
        let mut response = StunMessage::binding_response(message.transaction_id);
        response.add_attribute(StunAttribute::xor_mapped_address(source, &message.transaction_id));
        let wire = response.encode_with(Some(&short_term_key(&self.local_pwd)), true);
        self.packet_tx
            .send(OutboundPacket { component, data: wire, dest: source })
            .await
            .map_err(|_| Error::InvalidState("packet queue closed".to_string()))?;

        // New source → peer-reflexive remote candidate.
        let remote_idx = match self.remote_cands.iter().position(|c| c.addr == source) {
            Some(i) => i,
            None => {
                let priority = message
                    .attribute(StunAttributeType::Priority)
                    .and_then(|a| a.as_u32().ok())
                    .unwrap_or_else(|| {
                        compute_priority(CandidateType::PeerReflexive, 0, component)
                    });
                let prflx =
                    Candidate::peer_reflexive(component, source, source, priority);
                info!(%prflx, "discovered peer-reflexive remote candidate");
                self.remote_cands.push(prflx);
                self.remote_cands.len() - 1
            }
        };

        // Find or create the matching check.
        let local_idx = self
            .local_cands
            .iter()
            .position(|c| c.component == component && c.kind == CandidateType::Host)
            .ok_or_else(|| Error::Ice(format!("no local candidate for component {}", component)))?;
        let check_idx = match self
            .checks
            .iter()
            .position(|c| c.local == local_idx && c.remote == remote_idx)
        {
            Some(i) => i,
            None => {
                let (o, a) = match self.role {
                    IceRole::Controlling => (
                        self.local_cands[local_idx].priority,
                        self.remote_cands[remote_idx].priority,
                    ),
                    IceRole::Controlled => (
                        self.remote_cands[remote_idx].priority,
                        self.local_cands[local_idx].priority,
                    ),
                };
                self.checks.push(Check {
                    local: local_idx,
                    remote: remote_idx,
                    foundation: format!(
                        "{}:{}",
                        self.local_cands[local_idx].foundation,
                        self.remote_cands[remote_idx].foundation
                    ),
                    priority: pair_priority(o, a),
                    state: CheckState::Waiting,
                    nominated: false,
                    err_code: None,
                    txid: None,
                    sent_at: None,
                    retransmits: 0,
                });
                self.checks.len() - 1
            }
        };

        let use_candidate = message.attribute(StunAttributeType::UseCandidate).is_some();
        if use_candidate {
            self.checks[check_idx].nominated = true;
        }

        match self.checks[check_idx].state {
            // Triggered check right away, ahead of the pacing queue.
            CheckState::Frozen | CheckState::Waiting => {
                let nominate =
                    self.checks[check_idx].nominated || self.role == IceRole::Controlling;
                if self.remote_pwd.is_some() {
                    let _ = self.send_check(check_idx, nominate).await;
                }
            }
            CheckState::Succeeded if use_candidate => {
                self.nominate(component, check_idx).await;
                self.check_completion().await;
            }
            _ => {}
        }
        Ok(())
    }

    /// Nominate a succeeded check: cancel losers, keep the nominated
    /// index monotonic by priority.
    async fn nominate(&mut self, component: u8, idx: usize) {
        // Cancel everything still pending for the component.
        for (i, check) in self.checks.iter_mut().enumerate() {
            if i == idx {
                continue;
            }
            if self.local_cands[check.local].component == component
                && matches!(check.state, CheckState::Frozen | CheckState::Waiting)
            {
                check.state = CheckState::Failed;
                check.err_code = Some(487);
            }
        }

        let current_best = self.nominated.get(&component).map(|i| self.checks[*i].priority);
        // Never downgrade: a nomination only moves to a higher
        // priority pair.
        let upgrade = current_best.map(|p| self.checks[idx].priority > p).unwrap_or(true);
        if upgrade {
            self.nominated.insert(component, idx);
            info!(component, idx, "nominated check updated");
            let _ = self.events_tx.send(IceEvent::NominationUpdated { component }).await;
        }
    }

    /// Completion: success once every component has a nomination;
    /// failure once everything is terminal with none.
    async fn check_completion(&mut self) {
        if self.completed.is_some() {
            return;
        }
        let all_nominated =
            (1..=self.components).all(|c| self.nominated.contains_key(&c));
        if all_nominated {
            info!("ICE negotiation complete");
            self.completed = Some(true);
            let _ = self.events_tx.send(IceEvent::Completed { success: true }).await;
        }
    }

    /// Failure detection: all checks terminal, nothing nominated.
    fn check_doom(&mut self) {
        if self.completed.is_some() || self.checks.is_empty() {
            return;
        }
        let all_terminal = self.checks.iter().all(|c| c.state.is_terminal());
        let any_success = self.checks.iter().any(|c| c.state == CheckState::Succeeded);
        if all_terminal && !any_success {
            warn!("all connectivity checks failed");
            self.completed = Some(false);
            let events_tx = self.events_tx.clone();
            tokio::spawn(async move {
                let _ = events_tx.send(IceEvent::Completed { success: false }).await;
            });
        }
    }

    /// Binding Indication on the nominated pair, RFC 5245 §10.
    async fn keepalive(&mut self) {
        if self.completed != Some(true) {
            return;
        }
        if self.last_keepalive.elapsed() < self.config.keepalive_interval {
            return;
        }
        self.last_keepalive = Instant::now();
        if let Some(idx) = self.nominated.get(&1).copied() {
            let dest = self.remote_cands[self.checks[idx].remote].addr;
            let indication = StunMessage::binding_indication();
            let wire = indication.encode_with(None, true);
            trace!(%dest, "keepalive indication");
            let _ = self
                .packet_tx
                .send(OutboundPacket { component: 1, data: wire, dest })
                .await;
        }
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(len).map(char::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn checklist_orders_by_priority_and_unfreezes_head() {
        let (session, _events, _packets) =
            IceSession::new(IceRole::Controlling, 1, IceConfig::default());
        session.add_host_candidate(1, addr("10.0.0.1:4000")).await.unwrap();
        session.add_host_candidate(1, addr("192.168.1.1:4000")).await.unwrap();
        let remotes = vec![
            Candidate::host(1, addr("10.0.0.2:5000")).unwrap(),
            Candidate::host(1, addr("192.168.1.2:5000")).unwrap(),
        ];
        session.set_remote("ruf", "rpwd", remotes).await.unwrap();

        let checks = session.checks().await;
        assert_eq!(checks.len(), 4);
        // Sorted descending by pair priority.
        assert!(checks.windows(2).all(|w| w[0].priority >= w[1].priority));
        // Head is Waiting, and so is at least one other foundation.
        assert_eq!(checks[0].state, CheckState::Waiting);
        assert!(checks.iter().filter(|c| c.state == CheckState::Waiting).count() >= 2);
    }

    #[tokio::test]
    async fn empty_checklist_is_an_error() {
        let (session, _events, _packets) =
            IceSession::new(IceRole::Controlling, 1, IceConfig::default());
        session.add_host_candidate(1, addr("10.0.0.1:4000")).await.unwrap();
        // Mismatched component: no pairs form.
        let remotes = vec![Candidate::host(2, addr("10.0.0.2:5001")).unwrap()];
        assert!(session.set_remote("r", "p", remotes).await.is_err());
    }

    #[tokio::test]
    async fn start_requires_remote_credentials() {
        let (session, _events, _packets) =
            IceSession::new(IceRole::Controlling, 1, IceConfig::default());
        session.add_host_candidate(1, addr("10.0.0.1:4000")).await.unwrap();
        assert!(session.start().await.is_err());
    }
}
