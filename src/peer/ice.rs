use crate::peer::types::IceCandidate;
use std::collections::VecDeque;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

#[derive(Debug, Clone)]
struct Pending {
    from: String,
    candidate: IceCandidate,
}

/// Кандидаты, полученные до установки remote description.
/// Выдаются строго в порядке поступления (FIFO).
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    session_id: String,
    pending: VecDeque<Pending>,
}

impl CandidateBuffer {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            pending: VecDeque::new(),
        }
    }

    pub fn push(&mut self, from: &str, candidate: IceCandidate) {
        debug!(
            "Remote description not set yet, queuing candidate from {} (session {})",
            from, self.session_id
        );
        self.pending.push_back(Pending {
            from: from.to_string(),
            candidate,
        });
    }

    /// Забирает все отложенные кандидаты от `peer_id` в порядке поступления.
    /// Кандидаты от других участников отбрасываются.
    pub fn drain_for(&mut self, peer_id: &str) -> Vec<IceCandidate> {
        let mut out = Vec::with_capacity(self.pending.len());
        for entry in self.pending.drain(..) {
            if entry.from == peer_id {
                out.push(entry.candidate);
            } else {
                debug!("Dropping buffered candidate from untracked peer {}", entry.from);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            summary.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            summary.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            summary.relay += 1;
        }
    }

    info!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        summary.host, summary.srflx, summary.relay
    );

    if summary.relay == 0 {
        warn!("No TURN relay candidates found! Connection through NAT may fail.");
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(n: u32, typ: &str) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ {typ}"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn drains_in_arrival_order() {
        let mut buf = CandidateBuffer::new("s1");
        buf.push("userB", cand(1, "host"));
        buf.push("userB", cand(2, "srflx"));
        buf.push("userB", cand(3, "relay"));
        assert_eq!(buf.len(), 3);

        let drained = buf.drain_for("userB");
        assert_eq!(drained, vec![cand(1, "host"), cand(2, "srflx"), cand(3, "relay")]);
        assert!(buf.is_empty());
        assert!(buf.drain_for("userB").is_empty());
    }

    #[test]
    fn drain_discards_other_peers() {
        let mut buf = CandidateBuffer::new("s1");
        buf.push("userC", cand(1, "host"));
        buf.push("userB", cand(2, "host"));
        assert_eq!(buf.drain_for("userB"), vec![cand(2, "host")]);
        assert!(buf.is_empty());
    }

    #[test]
    fn summary_counts_types() {
        let summary = analyze_candidates(&[cand(1, "host"), cand(2, "host"), cand(3, "relay")]);
        assert_eq!(
            summary,
            CandidateSummary {
                host: 2,
                srflx: 0,
                relay: 1
            }
        );
    }

    #[test]
    fn converts_to_webrtc_init() {
        let init: RTCIceCandidateInit = cand(7, "host").into();
        assert_eq!(init.sdp_mline_index, Some(0));
        let back: IceCandidate = init.into();
        assert_eq!(back, cand(7, "host"));
    }
}
