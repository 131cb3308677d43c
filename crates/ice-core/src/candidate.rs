//! ICE candidates (RFC 5245 §4.1).

use std::fmt;
use std::net::SocketAddr;

use crate::error::{Error, Result};

/// Candidate type, in decreasing type-preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    PeerReflexive,
    ServerReflexive,
    Relayed,
}

impl CandidateType {
    /// RFC 5245 §4.1.2.2 recommended type preferences.
    pub fn type_preference(&self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relayed => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::Relayed => "relay",
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The component a candidate serves.
pub const COMPONENT_RTP: u8 = 1;
pub const COMPONENT_RTCP: u8 = 2;

/// One ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub component: u8,
    pub kind: CandidateType,
    /// Grouping tag: candidates sharing base and server share a
    /// foundation, which drives unfreezing.
    pub foundation: String,
    pub priority: u32,
    pub addr: SocketAddr,
    /// The local address the candidate is derived from (equals `addr`
    /// for host candidates).
    pub base_addr: SocketAddr,
}

impl Candidate {
    /// Build a candidate, computing priority
    /// `(type_pref << 24) | (local_pref << 8) | (256 - component)`
    /// and a foundation from type and base.
    pub fn new(
        component: u8,
        kind: CandidateType,
        addr: SocketAddr,
        base_addr: SocketAddr,
        local_pref: u16,
    ) -> Result<Candidate> {
        if component == 0 {
            return Err(Error::InvalidCandidate("component ids start at 1".to_string()));
        }
        let priority = compute_priority(kind, local_pref, component);
        let foundation = format!("{}{}", kind_tag(kind), base_addr.ip());
        Ok(Candidate { component, kind, foundation, priority, addr, base_addr })
    }

    /// Host candidate on a local address.
    pub fn host(component: u8, addr: SocketAddr) -> Result<Candidate> {
        Candidate::new(component, CandidateType::Host, addr, addr, 65535)
    }

    /// Peer-reflexive candidate learned from a check.
    pub fn peer_reflexive(
        component: u8,
        addr: SocketAddr,
        base_addr: SocketAddr,
        priority: u32,
    ) -> Candidate {
        Candidate {
            component,
            kind: CandidateType::PeerReflexive,
            foundation: format!("{}{}", kind_tag(CandidateType::PeerReflexive), base_addr.ip()),
            priority,
            addr,
            base_addr,
        }
    }

    /// IPv4/IPv6 family tag for pairing checks.
    pub fn family(&self) -> u8 {
        if self.addr.is_ipv4() { 4 } else { 6 }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} typ {}",
            self.foundation, self.component, self.priority, self.addr, self.kind
        )
    }
}

/// RFC 5245 §4.1.2.1 candidate priority.
pub fn compute_priority(kind: CandidateType, local_pref: u16, component: u8) -> u32 {
    (kind.type_preference() << 24) | ((local_pref as u32) << 8) | (256 - component as u32)
}

/// RFC 5245 §5.7.2 pair priority. `o` is the controlling agent's
/// candidate priority, `a` the controlled agent's.
pub fn pair_priority(o: u32, a: u32) -> u64 {
    let (o, a) = (o as u64, a as u64);
    (1u64 << 32) * o.min(a) + 2 * o.max(a) + if o > a { 1 } else { 0 }
}

fn kind_tag(kind: CandidateType) -> char {
    match kind {
        CandidateType::Host => 'H',
        CandidateType::PeerReflexive => 'P',
        CandidateType::ServerReflexive => 'S',
        CandidateType::Relayed => 'R',
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_formula() {
        // Host, max local pref, RTP component.
        assert_eq!(compute_priority(CandidateType::Host, 65535, 1), (126 << 24) | (65535 << 8) | 255);
        // RTCP component scores one lower in the bottom byte.
        assert_eq!(
            compute_priority(CandidateType::Host, 65535, 2),
            (126 << 24) | (65535 << 8) | 254
        );
        // Relay sits below everything.
        assert!(
            compute_priority(CandidateType::Relayed, 65535, 1)
                < compute_priority(CandidateType::ServerReflexive, 0, 1)
        );
    }

    #[test]
    fn pair_priority_formula() {
        // min dominates, the controlling side breaks ties.
        assert!(pair_priority(100, 200) > pair_priority(99, 200));
        assert_eq!(pair_priority(100, 200), (1u64 << 32) * 100 + 2 * 200);
        assert_eq!(pair_priority(200, 100), (1u64 << 32) * 100 + 2 * 200 + 1);
    }

    #[test]
    fn host_candidates_share_foundation_per_ip() {
        let a = Candidate::host(1, "10.0.0.1:4000".parse().unwrap()).unwrap();
        let b = Candidate::host(2, "10.0.0.1:4001".parse().unwrap()).unwrap();
        let c = Candidate::host(1, "10.0.0.2:4000".parse().unwrap()).unwrap();
        assert_eq!(a.foundation, b.foundation);
        assert_ne!(a.foundation, c.foundation);
    }

    #[test]
    fn zero_component_rejected() {
        assert!(Candidate::host(0, "10.0.0.1:4000".parse().unwrap()).is_err());
    }
}
