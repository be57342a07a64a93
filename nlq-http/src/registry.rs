use std::collections::HashMap;
use std::time::Duration;

use nlq_guard::{Execution, ExecutionError};
use nlq_types::ExecutionResult;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Open transactions awaiting commit or rollback, keyed by execution id.
#[derive(Default)]
pub struct TxnRegistry {
    open: Mutex<HashMap<Uuid, Execution>>,
}

impl TxnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn hold(&self, exec: Execution) -> Uuid {
        let id = exec.id;
        self.open.lock().await.insert(id, exec);
        id
    }

    pub async fn len(&self) -> usize {
        self.open.lock().await.len()
    }

    /// `None` when no transaction with this id is held.
    pub async fn commit(&self, id: Uuid) -> Option<Result<ExecutionResult, ExecutionError>> {
        let mut exec = self.open.lock().await.remove(&id)?;
        Some(exec.commit().await.cloned())
    }

    pub async fn rollback(&self, id: Uuid) -> Option<Result<ExecutionResult, ExecutionError>> {
        let mut exec = self.open.lock().await.remove(&id)?;
        Some(exec.rollback().await.cloned())
    }

    /// Roll back and forget every transaction idle past its timeout. The
    /// registry lock is released before any rollback runs.
    pub async fn sweep(&self) -> usize {
        let expired: Vec<Execution> = {
            let mut open = self.open.lock().await;
            let ids: Vec<Uuid> = open
                .iter()
                .filter(|(_, exec)| exec.is_expired())
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| open.remove(id)).collect()
        };
        let count = expired.len();
        for mut exec in expired {
            exec.expire_if_idle().await;
        }
        if count > 0 {
            tracing::info!(count, "rolled back idle transactions");
        }
        count
    }

    pub async fn sweep_every(&self, period: Duration) {
        let mut tick = tokio::time::interval(period);
        loop {
            tick.tick().await;
            self.sweep().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nlq_guard::{ExecutionGuard, ExecutionOutcome, GuardConfig, ScriptedBackend};
    use nlq_types::RequestContext;
    use std::sync::Arc;

    async fn open_delete(backend: &ScriptedBackend, idle: Duration) -> Execution {
        let guard = ExecutionGuard::new(
            Arc::new(backend.clone()),
            GuardConfig {
                idle_txn_timeout: idle,
                ..GuardConfig::default()
            },
        );
        match guard
            .execute("DELETE FROM TEMP_LOAD WHERE id = 1", true, &RequestContext::new())
            .await
            .unwrap()
        {
            ExecutionOutcome::Executed(exec) => exec,
            ExecutionOutcome::AwaitingConfirmation(p) => panic!("unexpected confirmation: {}", p.reason),
        }
    }

    #[tokio::test]
    async fn commit_by_id_applies_once() {
        let backend = ScriptedBackend::new().with_matching_rows("TEMP_LOAD", 1);
        let registry = TxnRegistry::new();
        let id = registry.hold(open_delete(&backend, Duration::from_secs(60)).await).await;

        let result = registry.commit(id).await.unwrap().unwrap();
        assert!(result.committed);
        assert_eq!(backend.applied().len(), 1);
        assert!(registry.commit(id).await.is_none());
    }

    #[tokio::test]
    async fn sweep_rolls_back_idle_transactions() {
        let backend = ScriptedBackend::new().with_matching_rows("TEMP_LOAD", 1);
        let registry = TxnRegistry::new();
        registry.hold(open_delete(&backend, Duration::from_millis(10)).await).await;
        let fresh = registry.hold(open_delete(&backend, Duration::from_secs(60)).await).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(registry.sweep().await, 1);
        assert_eq!(registry.len().await, 1);

        let result = registry.rollback(fresh).await.unwrap().unwrap();
        assert!(result.rolled_back);
        assert!(backend.applied().is_empty());
    }

    #[tokio::test]
    async fn slow_sweep_does_not_block_other_transactions() {
        let stuck = ScriptedBackend::new()
            .with_matching_rows("TEMP_LOAD", 1)
            .with_rollback_delay(Duration::from_secs(2));
        let healthy = ScriptedBackend::new().with_matching_rows("TEMP_LOAD", 1);
        let registry = Arc::new(TxnRegistry::new());
        registry.hold(open_delete(&stuck, Duration::from_millis(10)).await).await;
        let other = registry.hold(open_delete(&healthy, Duration::from_secs(60)).await).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let sweeper = Arc::clone(&registry);
        let sweep = tokio::spawn(async move { sweeper.sweep().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let committed = tokio::time::timeout(Duration::from_millis(500), registry.commit(other))
            .await
            .expect("commit waited on the sweep")
            .unwrap()
            .unwrap();
        assert!(committed.committed);
        assert_eq!(healthy.applied().len(), 1);
        assert_eq!(sweep.await.unwrap(), 1);
    }
}
