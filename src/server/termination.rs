use std::collections::BTreeMap;
use tracing::debug;

use crate::core::layout::Rank;
use crate::transport::IdleReport;

/// Outcome of a completed vote round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Two consecutive rounds saw every server idle with nothing in flight
    Terminate,
    /// Try again on a later tick
    Continue,
}

#[derive(Debug)]
struct Round {
    number: u64,
    reports: BTreeMap<Rank, IdleReport>,
}

/// Vote bookkeeping held by the master server.
///
/// A round collects one [`IdleReport`] per server. Termination needs every
/// server idle, as many counted messages received as sent, and the whole
/// report vector identical to the previous all-idle round: any request,
/// forwarded unit or transfer between the two rounds changes some counter.
#[derive(Debug)]
pub struct TerminationDetector {
    nservers: usize,
    next_round: u64,
    current: Option<Round>,
    previous: Option<Vec<IdleReport>>,
}

impl TerminationDetector {
    pub fn new(nservers: usize) -> Self {
        Self {
            nservers,
            next_round: 1,
            current: None,
            previous: None,
        }
    }

    pub fn is_voting(&self) -> bool {
        self.current.is_some()
    }

    /// Open a round with the master's own report; returns the round number
    pub fn begin_round(&mut self, own: Rank, report: IdleReport) -> u64 {
        let number = self.next_round;
        self.next_round += 1;
        let mut reports = BTreeMap::new();
        reports.insert(own, report);
        self.current = Some(Round { number, reports });
        number
    }

    /// Record a peer's reply; yields a verdict once every server answered
    pub fn record(&mut self, from: Rank, round: u64, report: IdleReport) -> Option<Verdict> {
        let current = self.current.as_mut()?;
        if current.number != round {
            debug!("Ignoring stale idle reply for round {} from {}", round, from);
            return None;
        }
        current.reports.insert(from, report);
        self.try_conclude()
    }

    /// Conclude the current round if it is complete
    pub fn try_conclude(&mut self) -> Option<Verdict> {
        if self.current.as_ref()?.reports.len() < self.nservers {
            return None;
        }
        let round = self.current.take()?;
        let reports: Vec<IdleReport> = round.reports.into_values().collect();

        let all_idle = reports.iter().all(|r| r.idle);
        let sent: u64 = reports.iter().map(|r| r.sent).sum();
        let received: u64 = reports.iter().map(|r| r.received).sum();
        if !all_idle || sent != received {
            debug!(
                "Round {}: not quiescent (all_idle={}, sent={}, received={})",
                round.number, all_idle, sent, received
            );
            self.previous = None;
            return Some(Verdict::Continue);
        }

        if self.previous.as_ref() == Some(&reports) {
            debug!("Round {}: quiescent twice in a row", round.number);
            return Some(Verdict::Terminate);
        }
        self.previous = Some(reports);
        Some(Verdict::Continue)
    }

    /// Number of rounds opened so far
    pub fn rounds(&self) -> u64 {
        self.next_round - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle(activity: u64) -> IdleReport {
        IdleReport {
            idle: true,
            activity,
            sent: 0,
            received: 0,
        }
    }

    #[test]
    fn test_single_server_needs_two_rounds() {
        let mut detector = TerminationDetector::new(1);
        detector.begin_round(0, idle(3));
        assert_eq!(detector.try_conclude(), Some(Verdict::Continue));
        detector.begin_round(0, idle(3));
        assert_eq!(detector.try_conclude(), Some(Verdict::Terminate));
        assert_eq!(detector.rounds(), 2);
    }

    #[test]
    fn test_activity_between_rounds_restarts() {
        let mut detector = TerminationDetector::new(2);
        let r = detector.begin_round(4, idle(1));
        assert_eq!(detector.record(5, r, idle(1)), Some(Verdict::Continue));

        let r = detector.begin_round(4, idle(1));
        assert_eq!(detector.record(5, r, idle(2)), Some(Verdict::Continue));

        let r = detector.begin_round(4, idle(1));
        assert_eq!(detector.record(5, r, idle(2)), Some(Verdict::Terminate));
    }

    #[test]
    fn test_unbalanced_counts_block_termination() {
        let mut detector = TerminationDetector::new(2);
        let in_flight = IdleReport {
            idle: true,
            activity: 0,
            sent: 1,
            received: 0,
        };
        for _ in 0..3 {
            let r = detector.begin_round(4, in_flight);
            assert_eq!(detector.record(5, r, idle(0)), Some(Verdict::Continue));
        }
    }

    #[test]
    fn test_busy_server_and_stale_replies() {
        let mut detector = TerminationDetector::new(2);
        let r = detector.begin_round(4, idle(0));
        assert_eq!(detector.record(5, r + 7, idle(0)), None);
        assert!(detector.is_voting());

        let busy = IdleReport {
            idle: false,
            ..idle(0)
        };
        assert_eq!(detector.record(5, r, busy), Some(Verdict::Continue));
        assert!(!detector.is_voting());
    }
}
