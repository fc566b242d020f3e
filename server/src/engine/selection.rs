//! Skill-window candidate selection.
//!
//! Two policies over a FIFO-ordered candidate list:
//!
//! - [`select_within_window`]: the earliest candidate whose skill falls
//!   within the window, or nobody. Used for live-queue pairing, where a bad
//!   skill match is worse than waiting for the AI fallback.
//! - [`select_nearest`]: window first, then the closest-skill candidate.
//!   Used where an opponent must always be produced (the AI roster).
//!
//! Ties always break toward the FIFO-earliest candidate, so both policies
//! are deterministic given their inputs.

/// Earliest candidate within `threshold` of `own_skill`, if any.
pub fn select_within_window<T>(
    own_skill: f64,
    threshold: f64,
    candidates: &[T],
    skill_of: impl Fn(&T) -> f64,
) -> Option<usize> {
    candidates
        .iter()
        .position(|candidate| (skill_of(candidate) - own_skill).abs() <= threshold)
}

/// Earliest candidate within the window, else the candidate minimizing the
/// skill gap. Only `None` for an empty slice.
pub fn select_nearest<T>(
    own_skill: f64,
    threshold: f64,
    candidates: &[T],
    skill_of: impl Fn(&T) -> f64,
) -> Option<usize> {
    if let Some(idx) = select_within_window(own_skill, threshold, candidates, &skill_of) {
        return Some(idx);
    }
    if candidates.is_empty() {
        return None;
    }

    // Strict `<` keeps the earliest candidate on ties.
    let mut best_idx = 0;
    let mut best_gap = (skill_of(&candidates[0]) - own_skill).abs();
    for (idx, candidate) in candidates.iter().enumerate().skip(1) {
        let gap = (skill_of(candidate) - own_skill).abs();
        if gap < best_gap {
            best_idx = idx;
            best_gap = gap;
        }
    }
    Some(best_idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(own: f64, threshold: f64, skills: &[f64]) -> Option<usize> {
        select_within_window(own, threshold, skills, |s| *s)
    }

    fn nearest(own: f64, threshold: f64, skills: &[f64]) -> Option<usize> {
        select_nearest(own, threshold, skills, |s| *s)
    }

    #[test]
    fn empty_candidates_yield_none() {
        assert_eq!(window(5.0, 1.5, &[]), None);
        assert_eq!(nearest(5.0, 1.5, &[]), None);
    }

    #[test]
    fn earliest_in_window_wins_over_closer_later_one() {
        // Index 0 is within the window even though index 1 is closer.
        assert_eq!(window(7.0, 1.5, &[6.0, 7.0]), Some(0));
        assert_eq!(nearest(7.0, 1.5, &[6.0, 7.0]), Some(0));
    }

    #[test]
    fn window_boundary_is_inclusive() {
        assert_eq!(window(7.0, 1.5, &[8.5]), Some(0));
        assert_eq!(window(7.0, 1.5, &[8.501]), None);
    }

    #[test]
    fn strict_selection_refuses_out_of_window_candidates() {
        // 3.0 vs 9.0 with threshold 1.5: no pair, however lonely the queue.
        assert_eq!(window(9.0, 1.5, &[3.0]), None);
        assert_eq!(window(3.0, 1.5, &[9.0]), None);
    }

    #[test]
    fn nearest_falls_back_to_argmin() {
        // Nobody within +-1.5 of 5.0; 7.5 is the closest.
        assert_eq!(nearest(5.0, 1.5, &[9.0, 7.5, 8.0]), Some(1));
    }

    #[test]
    fn nearest_ties_break_fifo() {
        // 3.0 and 7.0 are both 2.0 away; the earlier one wins.
        assert_eq!(nearest(5.0, 1.5, &[3.0, 7.0]), Some(0));
    }

    #[test]
    fn selection_is_deterministic() {
        let candidates = [9.9, 1.2, 6.4, 6.4, 8.1];
        let first = nearest(6.0, 1.5, &candidates);
        for _ in 0..10 {
            assert_eq!(nearest(6.0, 1.5, &candidates), first);
        }
    }
}
