//! Claim evaluation.
//!
//! Given each worker's claimed-partition count after the rendezvous, decides
//! who won the race and who must be closed. A worker with a zero count is a
//! loser. A run is only valid when exactly `workers - partitions` workers
//! lost and the winners together hold every partition once.

use thiserror::Error;

use crate::worker::WorkerId;

/// Outcome of a valid race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimVerdict {
    /// Workers holding at least one partition, in input order.
    pub winners: Vec<WorkerId>,
    /// Workers holding nothing, in input order. Every one of them is closed.
    pub losers: Vec<WorkerId>,
}

/// An observed claim distribution that the group protocol must never produce.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaimViolation {
    /// There was nothing to evaluate.
    #[error("no workers to evaluate")]
    NoWorkers,

    /// Every worker holds at least one partition.
    #[error("none of {workers} workers is without a partition")]
    NoLoser {
        /// Number of workers evaluated.
        workers: usize,
    },

    /// The number of zero-claim workers differs from `workers - partitions`.
    #[error("expected {expected} workers without a partition, found {actual}")]
    LoserCountMismatch {
        /// Losers the partition count allows.
        expected: usize,
        /// Losers observed.
        actual: usize,
    },

    /// The winners do not hold every partition exactly once.
    #[error("expected {expected} claimed partitions in total, found {actual}")]
    ClaimSumMismatch {
        /// Partitions on the topic.
        expected: usize,
        /// Sum of claimed counts.
        actual: usize,
    },
}

/// Classifies workers by their claimed-partition counts.
///
/// `claims` is `(worker, claimed count)` in worker order.
///
/// # Errors
///
/// Returns the first [`ClaimViolation`] found.
pub fn evaluate_claims(
    claims: &[(WorkerId, usize)],
    partitions: usize,
) -> Result<ClaimVerdict, ClaimViolation> {
    if claims.is_empty() {
        return Err(ClaimViolation::NoWorkers);
    }

    let (losers, winners): (Vec<(WorkerId, usize)>, Vec<(WorkerId, usize)>) =
        claims.iter().partition(|(_, count)| *count == 0);
    let losers: Vec<WorkerId> = losers.into_iter().map(|(id, _)| id).collect();
    let winners: Vec<WorkerId> = winners.into_iter().map(|(id, _)| id).collect();

    if losers.is_empty() {
        return Err(ClaimViolation::NoLoser {
            workers: claims.len(),
        });
    }

    let expected = claims.len().saturating_sub(partitions);
    if losers.len() != expected {
        return Err(ClaimViolation::LoserCountMismatch {
            expected,
            actual: losers.len(),
        });
    }

    let total: usize = claims.iter().map(|(_, count)| count).sum();
    if total != partitions {
        return Err(ClaimViolation::ClaimSumMismatch {
            expected: partitions,
            actual: total,
        });
    }

    Ok(ClaimVerdict { winners, losers })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u32]) -> Vec<WorkerId> {
        raw.iter().copied().map(WorkerId::new).collect()
    }

    fn claims(counts: &[usize]) -> Vec<(WorkerId, usize)> {
        counts
            .iter()
            .enumerate()
            .map(|(i, c)| (WorkerId::new(u32::try_from(i).unwrap() + 1), *c))
            .collect()
    }

    #[test]
    fn test_single_partition_two_workers() {
        let verdict = evaluate_claims(&claims(&[1, 0]), 1).unwrap();
        assert_eq!(verdict.winners, ids(&[1]));
        assert_eq!(verdict.losers, ids(&[2]));

        let verdict = evaluate_claims(&claims(&[0, 1]), 1).unwrap();
        assert_eq!(verdict.winners, ids(&[2]));
        assert_eq!(verdict.losers, ids(&[1]));
    }

    #[test]
    fn test_every_loser_is_reported() {
        let verdict = evaluate_claims(&claims(&[0, 1, 0, 1, 0]), 2).unwrap();
        assert_eq!(verdict.winners, ids(&[2, 4]));
        assert_eq!(verdict.losers, ids(&[1, 3, 5]));
    }

    #[test]
    fn test_no_loser_is_violation() {
        assert_eq!(
            evaluate_claims(&claims(&[1, 1]), 1),
            Err(ClaimViolation::NoLoser { workers: 2 })
        );
    }

    #[test]
    fn test_too_many_losers_is_violation() {
        assert_eq!(
            evaluate_claims(&claims(&[0, 0]), 1),
            Err(ClaimViolation::LoserCountMismatch {
                expected: 1,
                actual: 2
            })
        );
        // Two winners sharing one partition leave too few losers.
        assert_eq!(
            evaluate_claims(&claims(&[1, 1, 0]), 1),
            Err(ClaimViolation::LoserCountMismatch {
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn test_winner_holding_too_much_is_violation() {
        assert_eq!(
            evaluate_claims(&claims(&[2, 0]), 1),
            Err(ClaimViolation::ClaimSumMismatch {
                expected: 1,
                actual: 2
            })
        );
    }

    #[test]
    fn test_verdict_keeps_worker_order() {
        let input = vec![
            (WorkerId::new(4), 0),
            (WorkerId::new(2), 1),
            (WorkerId::new(9), 0),
        ];
        let verdict = evaluate_claims(&input, 1).unwrap();
        assert_eq!(verdict.winners, ids(&[2]));
        assert_eq!(verdict.losers, ids(&[4, 9]));
    }

    #[test]
    fn test_empty_input_is_violation() {
        assert_eq!(evaluate_claims(&[], 1), Err(ClaimViolation::NoWorkers));
    }
}
