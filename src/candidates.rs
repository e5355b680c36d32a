//! Buffering for connectivity candidates that arrive before a remote
//! description exists.
//!
//! Candidates trickle in over signaling and may beat the offer/answer they
//! belong to. The queue holds them in receipt order until the remote
//! description is applied, then hands them over exactly once; everything
//! after that applies immediately.

use std::collections::VecDeque;

use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

#[derive(Default)]
pub struct CandidateQueue {
    pending: VecDeque<RTCIceCandidateInit>,
    remote_set: bool,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a remote description has been applied yet.
    pub fn remote_description_set(&self) -> bool {
        self.remote_set
    }

    /// Accepts a candidate. Returns it back when it should be applied
    /// immediately (remote description already set); otherwise buffers it.
    pub fn enqueue(&mut self, candidate: RTCIceCandidateInit) -> Option<RTCIceCandidateInit> {
        if self.remote_set {
            Some(candidate)
        } else {
            self.pending.push_back(candidate);
            None
        }
    }

    /// Marks the remote description as applied and yields the buffered
    /// candidates in receipt order, clearing the queue.
    pub fn drain(&mut self) -> Vec<RTCIceCandidateInit> {
        self.remote_set = true;
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: format!("candidate:{n} 1 udp 2130706431 192.0.2.1 {} typ host", 5000 + n),
            ..Default::default()
        }
    }

    #[test]
    fn test_drain_preserves_receipt_order() {
        let mut q = CandidateQueue::new();
        for n in 0..5 {
            assert!(q.enqueue(candidate(n)).is_none());
        }
        let drained = q.drain();
        let ports: Vec<_> = drained.iter().map(|c| c.candidate.clone()).collect();
        for (n, c) in ports.iter().enumerate() {
            assert!(c.starts_with(&format!("candidate:{n} ")));
        }
    }

    #[test]
    fn test_drain_clears_exactly_once() {
        let mut q = CandidateQueue::new();
        q.enqueue(candidate(0));
        q.enqueue(candidate(1));

        assert_eq!(q.drain().len(), 2);
        assert!(q.is_empty());
        // A second drain yields nothing; no candidate is applied twice.
        assert!(q.drain().is_empty());
    }

    #[test]
    fn test_candidates_after_drain_apply_immediately() {
        let mut q = CandidateQueue::new();
        q.enqueue(candidate(0));
        q.drain();

        let c = q.enqueue(candidate(1));
        assert!(c.is_some());
        assert!(q.is_empty());
    }

    #[test]
    fn test_pending_only_while_remote_unset() {
        let mut q = CandidateQueue::new();
        assert!(!q.remote_description_set());
        q.enqueue(candidate(0));
        assert!(!q.is_empty());

        q.drain();
        assert!(q.remote_description_set());
        q.enqueue(candidate(1));
        assert!(q.is_empty());
    }
}
