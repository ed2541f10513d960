//! In-process cache implementations

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    CommandPath, DenormalizedResults, RenderCache, ResultPath, ResultStore, SubmissionKey,
};
use crate::render::CommandResultView;

/// `ResultStore` backed by a map behind one lock
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    submissions: RwLock<HashMap<SubmissionKey, DenormalizedResults>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn merge(
        &self,
        submission: SubmissionKey,
        path: CommandPath,
        result: CommandResultView,
    ) -> Result<()> {
        let mut submissions = self.submissions.write().await;
        submissions.entry(submission).or_default().merge(path, result);
        Ok(())
    }

    async fn replace_suite(
        &self,
        submission: SubmissionKey,
        suite_id: i64,
        results: Vec<(CommandPath, CommandResultView)>,
    ) -> Result<()> {
        let mut submissions = self.submissions.write().await;
        submissions
            .entry(submission)
            .or_default()
            .replace_suite(suite_id, results);
        Ok(())
    }

    async fn load(&self, submission: SubmissionKey) -> Result<DenormalizedResults> {
        let submissions = self.submissions.read().await;
        Ok(submissions.get(&submission).cloned().unwrap_or_default())
    }

    async fn prune(&self, project_id: i64, path: &ResultPath) -> Result<usize> {
        let mut submissions = self.submissions.write().await;
        let touched = submissions
            .iter_mut()
            .filter(|(key, _)| key.project_id == project_id)
            .map(|(_, results)| results.prune(path))
            .filter(|changed| *changed)
            .count();
        debug!("Pruned {:?} from {} submissions of project {}", path, touched, project_id);
        Ok(touched)
    }
}

/// `RenderCache` backed by an ordered map
#[derive(Debug, Default)]
pub struct MemoryRenderCache {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryRenderCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RenderCache for MemoryRenderCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn invalidate_prefix(&self, prefix: &str) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let doomed: Vec<String> = entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.remove(key);
        }
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{normal_results_key, normal_results_prefix};
    use std::sync::Arc;

    fn view(command_id: i64) -> CommandResultView {
        CommandResultView {
            command_id,
            ..CommandResultView::default()
        }
    }

    #[tokio::test]
    async fn test_concurrent_merges_into_one_submission_all_land() {
        let store = Arc::new(MemoryResultStore::new());
        let key = SubmissionKey::new(1, 1);

        let mut handles = Vec::new();
        for command_id in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .merge(key, CommandPath::new(1, command_id % 5, command_id), view(command_id))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.load(key).await.unwrap().command_count(), 50);
    }

    #[tokio::test]
    async fn test_prune_only_touches_project() {
        let store = MemoryResultStore::new();
        let path = CommandPath::new(1, 1, 1);
        store.merge(SubmissionKey::new(1, 10), path, view(1)).await.unwrap();
        store.merge(SubmissionKey::new(1, 11), path, view(1)).await.unwrap();
        store.merge(SubmissionKey::new(2, 12), path, view(1)).await.unwrap();

        let touched = store.prune(1, &ResultPath::command(path)).await.unwrap();
        assert_eq!(touched, 2);
        assert!(store.load(SubmissionKey::new(1, 10)).await.unwrap().get(&path).is_none());
        assert!(store.load(SubmissionKey::new(2, 12)).await.unwrap().get(&path).is_some());
    }

    #[tokio::test]
    async fn test_replace_suite_leaves_other_submissions_alone() {
        let store = MemoryResultStore::new();
        let path = CommandPath::new(1, 1, 1);
        let stale = CommandPath::new(1, 1, 2);
        store.merge(SubmissionKey::new(1, 10), stale, view(2)).await.unwrap();
        store.merge(SubmissionKey::new(1, 11), stale, view(2)).await.unwrap();

        store
            .replace_suite(SubmissionKey::new(1, 10), 1, vec![(path, view(1))])
            .await
            .unwrap();

        let replaced = store.load(SubmissionKey::new(1, 10)).await.unwrap();
        assert!(replaced.get(&path).is_some());
        assert!(replaced.get(&stale).is_none());
        let other = store.load(SubmissionKey::new(1, 11)).await.unwrap();
        assert!(other.get(&stale).is_some());
    }

    #[tokio::test]
    async fn test_load_unknown_submission_is_empty() {
        let store = MemoryResultStore::new();
        let results = store.load(SubmissionKey::new(3, 3)).await.unwrap();
        assert_eq!(results, DenormalizedResults::default());
    }

    #[tokio::test]
    async fn test_render_cache_prefix_invalidation() {
        let cache = MemoryRenderCache::new();
        cache.set(&normal_results_key(1, 1), "a").await.unwrap();
        cache.set(&normal_results_key(1, 2), "b").await.unwrap();
        cache.set(&normal_results_key(12, 1), "c").await.unwrap();
        cache.set("unrelated", "d").await.unwrap();

        let removed = cache.invalidate_prefix(&normal_results_prefix(1)).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cache.get(&normal_results_key(1, 1)).await.unwrap(), None);
        assert_eq!(
            cache.get(&normal_results_key(12, 1)).await.unwrap().as_deref(),
            Some("c")
        );
        assert_eq!(cache.get("unrelated").await.unwrap().as_deref(), Some("d"));
    }
}
