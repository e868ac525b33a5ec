//! In-memory build request store.
//!
//! Shared between every scheduler holding the same `Arc`, which makes it a
//! faithful stand-in for the database when several masters run in one
//! process (tests, `buildit simulate`).

use async_trait::async_trait;
use buildit_core::{BuildRequest, BuildRequestId, NewBuildRequest, ResourceId};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::repo::build_request::dedup_ids;
use crate::{BuildRequestStore, ClaimOutcome, DbError, DbResult};

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    requests: BTreeMap<BuildRequestId, BuildRequest>,
}

#[derive(Debug, Default)]
pub struct InMemoryBuildRequestStore {
    state: Mutex<MemoryState>,
}

impl InMemoryBuildRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BuildRequestStore for InMemoryBuildRequestStore {
    async fn add_build_request(&self, request: NewBuildRequest) -> DbResult<BuildRequest> {
        let mut state = self.state();
        state.next_id += 1;
        let id = BuildRequestId::new(state.next_id);
        let request = request.into_request(id);
        state.requests.insert(id, request.clone());
        Ok(request)
    }

    async fn get_build_request(&self, id: BuildRequestId) -> DbResult<BuildRequest> {
        self.state()
            .requests
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("build request {}", id)))
    }

    async fn get_unclaimed_build_requests(&self, builder: &str) -> DbResult<Vec<BuildRequest>> {
        let mut unclaimed: Vec<BuildRequest> = self
            .state()
            .requests
            .values()
            .filter(|r| r.builder == builder && !r.is_claimed() && !r.is_complete())
            .cloned()
            .collect();
        unclaimed.sort_by(|a, b| a.scheduling_order(b));
        Ok(unclaimed)
    }

    async fn claim_build_requests(
        &self,
        ids: &[BuildRequestId],
        claimant: ResourceId,
        claimed_at: DateTime<Utc>,
    ) -> DbResult<ClaimOutcome> {
        let ids = dedup_ids(ids);
        let mut state = self.state();

        let conflicts: Vec<BuildRequestId> = ids
            .iter()
            .copied()
            .filter(|id| {
                state
                    .requests
                    .get(id)
                    .is_none_or(|r| r.is_claimed() || r.is_complete())
            })
            .collect();
        if !conflicts.is_empty() {
            return Ok(ClaimOutcome::AlreadyClaimed(conflicts));
        }

        for id in &ids {
            if let Some(request) = state.requests.get_mut(id) {
                request.claimed_by = Some(claimant);
                request.claimed_at = Some(claimed_at);
            }
        }
        Ok(ClaimOutcome::Claimed)
    }

    async fn unclaim_build_requests(&self, ids: &[BuildRequestId]) -> DbResult<()> {
        let mut state = self.state();
        for id in ids {
            if let Some(request) = state.requests.get_mut(id) {
                if !request.is_complete() {
                    request.claimed_by = None;
                    request.claimed_at = None;
                }
            }
        }
        Ok(())
    }

    async fn complete_build_requests(
        &self,
        ids: &[BuildRequestId],
        complete_at: DateTime<Utc>,
    ) -> DbResult<()> {
        let mut state = self.state();
        for id in ids {
            if let Some(request) = state.requests.get_mut(id) {
                request.complete_at = Some(complete_at);
            }
        }
        Ok(())
    }

    async fn get_oldest_request_time(&self, builder: &str) -> DbResult<Option<DateTime<Utc>>> {
        Ok(self
            .state()
            .requests
            .values()
            .filter(|r| r.builder == builder && !r.is_claimed() && !r.is_complete())
            .map(|r| r.submitted_at)
            .min())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    async fn seeded() -> InMemoryBuildRequestStore {
        let store = InMemoryBuildRequestStore::new();
        store
            .add_build_request(NewBuildRequest::new("A", at(135_000)))
            .await
            .unwrap();
        store
            .add_build_request(NewBuildRequest::new("A", at(130_000)))
            .await
            .unwrap();
        store
            .add_build_request(NewBuildRequest::new("B", at(120_000)))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_unclaimed_requests_sorted_oldest_first() {
        let store = seeded().await;
        let unclaimed = store.get_unclaimed_build_requests("A").await.unwrap();
        let ids: Vec<i64> = unclaimed.iter().map(|r| r.id.get()).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_claim_is_all_or_nothing() {
        let store = seeded().await;
        let first = ResourceId::new();
        let second = ResourceId::new();

        let outcome = store
            .claim_build_requests(&[BuildRequestId::new(1)], first, at(140_000))
            .await
            .unwrap();
        assert_eq!(outcome, ClaimOutcome::Claimed);

        let outcome = store
            .claim_build_requests(
                &[BuildRequestId::new(2), BuildRequestId::new(1)],
                second,
                at(140_001),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::AlreadyClaimed(vec![BuildRequestId::new(1)])
        );

        // request 2 was not claimed as a side effect
        let two = store.get_build_request(BuildRequestId::new(2)).await.unwrap();
        assert!(!two.is_claimed());
    }

    #[tokio::test]
    async fn test_unknown_ids_conflict() {
        let store = seeded().await;
        let outcome = store
            .claim_build_requests(&[BuildRequestId::new(99)], ResourceId::new(), at(1))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::AlreadyClaimed(vec![BuildRequestId::new(99)])
        );
    }

    #[tokio::test]
    async fn test_unclaim_makes_request_visible_again() {
        let store = seeded().await;
        let ids = [BuildRequestId::new(2)];
        store
            .claim_build_requests(&ids, ResourceId::new(), at(140_000))
            .await
            .unwrap();
        assert_eq!(store.get_unclaimed_build_requests("A").await.unwrap().len(), 1);

        store.unclaim_build_requests(&ids).await.unwrap();
        store.unclaim_build_requests(&ids).await.unwrap();
        assert_eq!(store.get_unclaimed_build_requests("A").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_completed_requests_stay_claimed() {
        let store = seeded().await;
        let ids = [BuildRequestId::new(3)];
        store
            .claim_build_requests(&ids, ResourceId::new(), at(140_000))
            .await
            .unwrap();
        store.complete_build_requests(&ids, at(150_000)).await.unwrap();
        store.unclaim_build_requests(&ids).await.unwrap();

        let req = store.get_build_request(ids[0]).await.unwrap();
        assert!(req.is_claimed());
        assert!(req.is_complete());
        assert!(store.get_unclaimed_build_requests("B").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oldest_request_time() {
        let store = seeded().await;
        assert_eq!(
            store.get_oldest_request_time("A").await.unwrap(),
            Some(at(130_000))
        );
        assert_eq!(store.get_oldest_request_time("C").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let store = Arc::new(seeded().await);
        let ids = [BuildRequestId::new(2)];

        let (a, b) = tokio::join!(
            store.claim_build_requests(&ids, ResourceId::new(), at(140_000)),
            store.claim_build_requests(&ids, ResourceId::new(), at(140_000)),
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        let winners = outcomes
            .iter()
            .filter(|o| **o == ClaimOutcome::Claimed)
            .count();
        assert_eq!(winners, 1);
        assert!(outcomes.contains(&ClaimOutcome::AlreadyClaimed(vec![ids[0]])));
    }
}
