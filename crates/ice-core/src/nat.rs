//! NAT type detection, RFC 3489 §10.1 style.
//!
//! Advisory only; ICE does not depend on the result. The detector is
//! a pure state machine: the embedder sends the binding requests it
//! asks for and feeds responses (or timeouts) back in.

use std::net::SocketAddr;

use crate::error::{Error, Result};

/// Categorical NAT type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatType {
    /// No NAT, unfiltered.
    Open,
    /// Endpoint-independent mapping and filtering.
    FullCone,
    /// Address-restricted filtering.
    Restricted,
    /// Address-and-port-restricted filtering.
    PortRestricted,
    /// Mapping depends on the destination.
    Symmetric,
    /// UDP is blocked outright.
    Blocked,
    /// Detection did not finish.
    Unknown,
}

impl NatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NatType::Open => "Open Internet",
            NatType::FullCone => "Full Cone",
            NatType::Restricted => "Restricted Cone",
            NatType::PortRestricted => "Port Restricted Cone",
            NatType::Symmetric => "Symmetric",
            NatType::Blocked => "Blocked",
            NatType::Unknown => "Unknown",
        }
    }
}

/// The binding test to run next.
///
/// Test I: plain binding request to the primary server address.
/// Test II: request CHANGE-REQUEST change-IP+port.
/// Test III: request CHANGE-REQUEST change-port only.
/// Test I': plain binding request to the server's alternate address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatTest {
    TestI,
    TestII,
    TestIPrime,
    TestIII,
}

/// Outcome of one test as the embedder observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOutcome {
    /// A response arrived with this mapped address.
    Mapped(SocketAddr),
    /// The test timed out.
    Timeout,
}

enum DetectState {
    AwaitingTestI,
    AwaitingTestII { mapped: SocketAddr, on_public_address: bool },
    AwaitingTestIPrime { mapped: SocketAddr },
    AwaitingTestIII { mapped: SocketAddr },
    Done(NatType),
}

/// RFC 3489 classification flow.
pub struct NatDetector {
    /// The local address the probes are sent from.
    local_addr: SocketAddr,
    state: DetectState,
}

impl NatDetector {
    pub fn new(local_addr: SocketAddr) -> Self {
        NatDetector { local_addr, state: DetectState::AwaitingTestI }
    }

    /// The test to run now, or `None` when classification finished.
    pub fn next_test(&self) -> Option<NatTest> {
        match &self.state {
            DetectState::AwaitingTestI => Some(NatTest::TestI),
            DetectState::AwaitingTestII { .. } => Some(NatTest::TestII),
            DetectState::AwaitingTestIPrime { .. } => Some(NatTest::TestIPrime),
            DetectState::AwaitingTestIII { .. } => Some(NatTest::TestIII),
            DetectState::Done(_) => None,
        }
    }

    /// Feed the outcome of the test returned by `next_test`.
    pub fn on_outcome(&mut self, test: NatTest, outcome: TestOutcome) -> Result<()> {
        if self.next_test() != Some(test) {
            return Err(Error::InvalidState(format!("unexpected outcome for {:?}", test)));
        }
        self.state = match (&self.state, outcome) {
            // Test I: no answer at all means UDP is blocked.
            (DetectState::AwaitingTestI, TestOutcome::Timeout) => {
                DetectState::Done(NatType::Blocked)
            }
            (DetectState::AwaitingTestI, TestOutcome::Mapped(mapped)) => {
                DetectState::AwaitingTestII {
                    mapped,
                    on_public_address: mapped == self.local_addr,
                }
            }
            // Test II from a public address: response → Open, none →
            // symmetric firewall (reported as Restricted here).
            (
                DetectState::AwaitingTestII { on_public_address: true, .. },
                TestOutcome::Mapped(_),
            ) => DetectState::Done(NatType::Open),
            (
                DetectState::AwaitingTestII { on_public_address: true, .. },
                TestOutcome::Timeout,
            ) => DetectState::Done(NatType::Restricted),
            // Behind a NAT: Test II response means full cone.
            (
                DetectState::AwaitingTestII { on_public_address: false, .. },
                TestOutcome::Mapped(_),
            ) => DetectState::Done(NatType::FullCone),
            (
                DetectState::AwaitingTestII { on_public_address: false, mapped },
                TestOutcome::Timeout,
            ) => DetectState::AwaitingTestIPrime { mapped: *mapped },
            // Test I': a different mapping toward another address is
            // a symmetric NAT.
            (DetectState::AwaitingTestIPrime { mapped }, TestOutcome::Mapped(second)) => {
                if second != *mapped {
                    DetectState::Done(NatType::Symmetric)
                } else {
                    DetectState::AwaitingTestIII { mapped: *mapped }
                }
            }
            (DetectState::AwaitingTestIPrime { .. }, TestOutcome::Timeout) => {
                DetectState::Done(NatType::Unknown)
            }
            // Test III separates restricted from port-restricted.
            (DetectState::AwaitingTestIII { .. }, TestOutcome::Mapped(_)) => {
                DetectState::Done(NatType::Restricted)
            }
            (DetectState::AwaitingTestIII { .. }, TestOutcome::Timeout) => {
                DetectState::Done(NatType::PortRestricted)
            }
            (DetectState::Done(t), _) => DetectState::Done(*t),
        };
        Ok(())
    }

    /// The verdict once `next_test` returns `None`.
    pub fn result(&self) -> NatType {
        match &self.state {
            DetectState::Done(t) => *t,
            _ => NatType::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn run(
        local: &str,
        outcomes: &[(NatTest, TestOutcome)],
    ) -> NatType {
        let mut detector = NatDetector::new(addr(local));
        for (test, outcome) in outcomes {
            assert_eq!(detector.next_test(), Some(*test));
            detector.on_outcome(*test, *outcome).unwrap();
        }
        assert_eq!(detector.next_test(), None);
        detector.result()
    }

    #[test]
    fn blocked_when_test_i_times_out() {
        assert_eq!(
            run("10.0.0.5:3478", &[(NatTest::TestI, TestOutcome::Timeout)]),
            NatType::Blocked
        );
    }

    #[test]
    fn open_internet() {
        let me = "203.0.113.9:3478";
        assert_eq!(
            run(
                me,
                &[
                    (NatTest::TestI, TestOutcome::Mapped(addr(me))),
                    (NatTest::TestII, TestOutcome::Mapped(addr(me))),
                ]
            ),
            NatType::Open
        );
    }

    #[test]
    fn full_cone() {
        assert_eq!(
            run(
                "10.0.0.5:3478",
                &[
                    (NatTest::TestI, TestOutcome::Mapped(addr("203.0.113.9:40000"))),
                    (NatTest::TestII, TestOutcome::Mapped(addr("203.0.113.9:40000"))),
                ]
            ),
            NatType::FullCone
        );
    }

    #[test]
    fn symmetric_nat_changes_mapping() {
        assert_eq!(
            run(
                "10.0.0.5:3478",
                &[
                    (NatTest::TestI, TestOutcome::Mapped(addr("203.0.113.9:40000"))),
                    (NatTest::TestII, TestOutcome::Timeout),
                    (NatTest::TestIPrime, TestOutcome::Mapped(addr("203.0.113.9:40001"))),
                ]
            ),
            NatType::Symmetric
        );
    }

    #[test]
    fn port_restricted_cone() {
        assert_eq!(
            run(
                "10.0.0.5:3478",
                &[
                    (NatTest::TestI, TestOutcome::Mapped(addr("203.0.113.9:40000"))),
                    (NatTest::TestII, TestOutcome::Timeout),
                    (NatTest::TestIPrime, TestOutcome::Mapped(addr("203.0.113.9:40000"))),
                    (NatTest::TestIII, TestOutcome::Timeout),
                ]
            ),
            NatType::PortRestricted
        );
    }

    #[test]
    fn restricted_cone() {
        assert_eq!(
            run(
                "10.0.0.5:3478",
                &[
                    (NatTest::TestI, TestOutcome::Mapped(addr("203.0.113.9:40000"))),
                    (NatTest::TestII, TestOutcome::Timeout),
                    (NatTest::TestIPrime, TestOutcome::Mapped(addr("203.0.113.9:40000"))),
                    (NatTest::TestIII, TestOutcome::Mapped(addr("203.0.113.9:40000"))),
                ]
            ),
            NatType::Restricted
        );
    }
}
