//! Pure merge of the cache view and the durable view of one task.
//!
//! Rules, in order:
//! 1. A terminal value in either store wins over a non-terminal value in the
//!    other. If both are terminal the durable store wins.
//! 2. A task that is executing in either view and has artifacts in either
//!    view is complete.
//! 3. Otherwise the durable store is authoritative and the cache follows it.

use crate::core::task::{TaskOutput, TaskSnapshot};

/// What must be written to bring both stores into agreement.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeResolution {
    /// Views already agree.
    InSync,
    /// The cache holds a terminal state the durable row lacks.
    PromoteDurable(TaskSnapshot),
    /// A result exists; both stores must become `completed` with it.
    CompleteWithArtifacts(TaskOutput),
    /// The durable row is authoritative; overwrite the cache.
    RefreshCache(TaskSnapshot),
}

/// Resolve `cache` against `durable`.
pub fn merge_snapshots(cache: Option<&TaskSnapshot>, durable: &TaskSnapshot) -> MergeResolution {
    if durable.status.is_terminal() {
        return match cache {
            Some(c) if c.same_observable_state(durable) => MergeResolution::InSync,
            _ => MergeResolution::RefreshCache(durable.clone()),
        };
    }

    if let Some(c) = cache.filter(|c| c.status.is_terminal()) {
        return MergeResolution::PromoteDurable(c.clone());
    }

    let executing =
        durable.status.is_executing() || cache.is_some_and(|c| c.status.is_executing());
    if executing {
        let artifacts = durable
            .output_data
            .as_ref()
            .filter(|o| o.has_artifacts())
            .or_else(|| cache.and_then(|c| c.output_data.as_ref()).filter(|o| o.has_artifacts()));
        if let Some(output) = artifacts {
            return MergeResolution::CompleteWithArtifacts(output.clone());
        }
    }

    match cache {
        Some(c) if c.same_observable_state(durable) => MergeResolution::InSync,
        _ => MergeResolution::RefreshCache(durable.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::{Priority, Task, TaskStatus, TaskType};
    use crate::util::clock::now;

    fn snap(status: TaskStatus) -> TaskSnapshot {
        let mut task = Task::new("u1", TaskType::TextToImage, Priority::Medium, serde_json::json!({}), now());
        task.status = status;
        task.snapshot()
    }

    fn with_urls(mut s: TaskSnapshot, urls: &[&str]) -> TaskSnapshot {
        s.output_data = Some(TaskOutput::new(urls.iter().map(|u| (*u).to_owned()).collect()));
        s
    }

    #[test]
    fn identical_views_are_in_sync() {
        let durable = snap(TaskStatus::Pending);
        assert_eq!(merge_snapshots(Some(&durable), &durable), MergeResolution::InSync);
    }

    #[test]
    fn missing_cache_entry_is_refreshed() {
        let durable = snap(TaskStatus::Pending);
        assert_eq!(
            merge_snapshots(None, &durable),
            MergeResolution::RefreshCache(durable.clone())
        );
    }

    #[test]
    fn terminal_cache_wins_over_non_terminal_durable() {
        let durable = snap(TaskStatus::Processing);
        let mut cache = durable.clone();
        cache.status = TaskStatus::Cancelled;
        assert_eq!(
            merge_snapshots(Some(&cache), &durable),
            MergeResolution::PromoteDurable(cache.clone())
        );
    }

    #[test]
    fn terminal_durable_wins_over_non_terminal_cache() {
        let durable = with_urls(snap(TaskStatus::Completed), &["a.png"]);
        let mut cache = durable.clone();
        cache.status = TaskStatus::Processing;
        cache.output_data = None;
        assert_eq!(
            merge_snapshots(Some(&cache), &durable),
            MergeResolution::RefreshCache(durable.clone())
        );
    }

    #[test]
    fn durable_wins_when_both_terminal() {
        let durable = snap(TaskStatus::Failed);
        let mut cache = durable.clone();
        cache.status = TaskStatus::Cancelled;
        assert_eq!(
            merge_snapshots(Some(&cache), &durable),
            MergeResolution::RefreshCache(durable.clone())
        );
    }

    #[test]
    fn artifacts_in_durable_complete_an_executing_task() {
        let durable = with_urls(snap(TaskStatus::Processing), &["x.png"]);
        let resolution = merge_snapshots(None, &durable);
        assert_eq!(
            resolution,
            MergeResolution::CompleteWithArtifacts(TaskOutput::new(vec!["x.png".into()]))
        );
    }

    #[test]
    fn artifacts_in_cache_complete_a_transient_task() {
        let durable = snap(TaskStatus::Processing);
        let cache = with_urls(snap(TaskStatus::ProcessingCompleted), &["y.png"]);
        assert!(matches!(
            merge_snapshots(Some(&cache), &durable),
            MergeResolution::CompleteWithArtifacts(o) if o.image_urls == vec!["y.png".to_owned()]
        ));
    }

    #[test]
    fn empty_urls_do_not_count_as_artifacts() {
        let durable = with_urls(snap(TaskStatus::Processing), &[""]);
        assert!(matches!(merge_snapshots(None, &durable), MergeResolution::RefreshCache(_)));
    }

    #[test]
    fn non_terminal_disagreement_follows_durable() {
        let durable = snap(TaskStatus::Processing);
        let mut cache = durable.clone();
        cache.status = TaskStatus::Pending;
        assert_eq!(
            merge_snapshots(Some(&cache), &durable),
            MergeResolution::RefreshCache(durable.clone())
        );
    }

    #[test]
    fn merge_is_idempotent_after_applying_resolution() {
        let durable = snap(TaskStatus::Pending);
        let mut cache = durable.clone();
        cache.queue_position = Some(9);
        let MergeResolution::RefreshCache(applied) = merge_snapshots(Some(&cache), &durable) else {
            panic!("expected refresh");
        };
        assert_eq!(merge_snapshots(Some(&applied), &durable), MergeResolution::InSync);
    }
}
