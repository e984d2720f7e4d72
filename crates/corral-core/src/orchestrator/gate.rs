//! Per-project concurrency gate.
//!
//! The gate has no state of its own: the running-agents map is the
//! counter. It is evaluated inside the per-task lock at start time, so
//! admission is all-or-nothing. The core does not queue; a denied caller
//! may retry.

/// Whether a project can admit one more agent.
///
/// `running_projects` is the project id of every currently running agent.
pub fn admits<'a>(
    running_projects: impl Iterator<Item = &'a str>,
    project_id: &str,
    max_concurrent: usize,
) -> bool {
    running_projects.filter(|p| *p == project_id).count() < max_concurrent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_under_limit() {
        let running = ["p1", "p2", "p1"];
        assert!(admits(running.iter().copied(), "p1", 3));
        assert!(admits(running.iter().copied(), "p2", 2));
    }

    #[test]
    fn denies_at_limit() {
        let running = ["p1", "p1"];
        assert!(!admits(running.iter().copied(), "p1", 2));
    }

    #[test]
    fn other_projects_do_not_count() {
        let running = ["p2", "p2", "p2"];
        assert!(admits(running.iter().copied(), "p1", 1));
    }

    #[test]
    fn zero_limit_admits_nothing() {
        assert!(!admits(std::iter::empty(), "p1", 0));
    }

    #[test]
    fn release_frees_a_slot() {
        let mut running = vec!["p1", "p1"];
        assert!(!admits(running.iter().copied(), "p1", 2));
        running.pop();
        assert!(admits(running.iter().copied(), "p1", 2));
    }
}
