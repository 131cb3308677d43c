//! 3xx redirect handling policy.

use waveline_sip_core::{Address, HeaderAccess, HeaderName, Response};

/// What to do with one redirect target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectAction {
    /// Follow this Contact now.
    Accept,
    /// Skip this Contact, try the next one.
    Reject,
    /// Stop following redirects; the session fails with the 3xx code.
    Stop,
    /// Park the decision; the application calls `process_redirect`.
    Pending,
}

/// Policy callback deciding each redirect target in turn.
pub type RedirectPolicy = dyn Fn(&Address) -> RedirectAction + Send + Sync;

/// Targets extracted from a 3xx, ordered by descending `q`.
#[derive(Debug, Default)]
pub struct RedirectState {
    targets: Vec<Address>,
    next: usize,
    /// Set while a Pending decision is parked.
    pub awaiting_decision: bool,
}

impl RedirectState {
    /// Load the Contact set of a 3xx response.
    pub fn load(&mut self, response: &Response) {
        let mut targets: Vec<Address> = response
            .headers_named(&HeaderName::Contact)
            .filter_map(|h| h.as_address())
            .cloned()
            .collect();
        targets.sort_by(|a, b| {
            b.q_value().partial_cmp(&a.q_value()).unwrap_or(std::cmp::Ordering::Equal)
        });
        self.targets = targets;
        self.next = 0;
        self.awaiting_decision = false;
    }

    /// Next untried target, advancing the cursor.
    pub fn pop_next(&mut self) -> Option<Address> {
        let target = self.targets.get(self.next).cloned();
        if target.is_some() {
            self.next += 1;
        }
        target
    }

    /// Current target without advancing (for Pending).
    pub fn current(&self) -> Option<&Address> {
        self.targets.get(self.next.saturating_sub(1))
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waveline_sip_core::parse_response;

    #[test]
    fn targets_ordered_by_q() {
        let raw = "SIP/2.0 302 Moved Temporarily\r\n\
            Via: SIP/2.0/UDP a;branch=z9hG4bKr\r\n\
            To: <sip:b@b>;tag=1\r\nFrom: <sip:a@a>;tag=2\r\n\
            Call-ID: r\r\nCSeq: 1 INVITE\r\n\
            Contact: <sip:low@x>;q=0.1\r\n\
            Contact: <sip:high@x>;q=0.9\r\n\
            Contact: <sip:default@x>\r\n\r\n";
        let response = parse_response(raw.as_bytes()).unwrap();
        let mut state = RedirectState::default();
        state.load(&response);
        assert_eq!(state.pop_next().unwrap().uri.user.as_deref(), Some("default"));
        assert_eq!(state.pop_next().unwrap().uri.user.as_deref(), Some("high"));
        assert_eq!(state.pop_next().unwrap().uri.user.as_deref(), Some("low"));
        assert!(state.pop_next().is_none());
    }
}
