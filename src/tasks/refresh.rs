//! Site information refresh callback.
//!
//! Walks the site list in batches, refreshing each site through a
//! [`SiteInfoSource`], and yields between batches with the list offset in
//! the state bag. Per-site failures are reported and skipped; the batch as
//! a whole keeps going.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::core::callback::{Callback, CallbackError, RunContext};
use crate::core::state::StateBag;
use crate::core::status::Status;
use crate::core::types::SiteId;

const OFFSET_KEY: &str = "limit_start";

/// Failure reported by a site information source.
#[derive(Debug, Error)]
#[error("site info error: {0}")]
pub struct SiteInfoError(pub String);

/// Narrow interface to the site inventory and its refresh mechanism.
#[async_trait]
pub trait SiteInfoSource: Send + Sync {
    /// Stable, ordered list of refreshable site ids.
    async fn site_ids(&self) -> Result<Vec<SiteId>, SiteInfoError>;

    /// Refresh one site's cached information.
    async fn refresh(&self, site_id: SiteId, force: bool) -> Result<(), SiteInfoError>;
}

/// Typed payload of a refresh task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshParams {
    /// Offset into the site list where this run starts.
    #[serde(default)]
    pub limit_start: usize,
    /// Batch size per invocation.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Refresh even when the cached information is still fresh.
    #[serde(default)]
    pub force: bool,
    /// Restrict the run to these site ids; empty means all sites.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter_ids: Vec<i64>,
}

fn default_limit() -> usize {
    10
}

impl Default for RefreshParams {
    fn default() -> Self {
        Self {
            limit_start: 0,
            limit: default_limit(),
            force: false,
            filter_ids: Vec::new(),
        }
    }
}

/// Callback refreshing cached site information in batches.
pub struct RefreshCallback<S> {
    source: Arc<S>,
}

impl<S: SiteInfoSource> RefreshCallback<S> {
    /// Create a refresh callback over the given source.
    pub fn new(source: Arc<S>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl<S: SiteInfoSource + 'static> Callback for RefreshCallback<S> {
    fn task_type(&self) -> &str {
        "refreshsiteinfo"
    }

    async fn invoke(
        &self,
        ctx: &mut RunContext,
        state: &mut StateBag,
    ) -> Result<Status, CallbackError> {
        let params: RefreshParams = ctx
            .params
            .decode_payload()
            .map_err(|e| CallbackError::Configuration(e.to_string()))?;
        if params.limit == 0 {
            return Err(CallbackError::Configuration(
                "refresh batch size must be positive".into(),
            ));
        }

        // Progress lives in the bag so a resumed run continues where the
        // previous invocation stopped; params only seed the first offset.
        let offset: usize = state.get_or(OFFSET_KEY, params.limit_start);

        let mut sites = self
            .source
            .site_ids()
            .await
            .map_err(|e| CallbackError::Remote(e.to_string()))?;
        if !params.filter_ids.is_empty() {
            sites.retain(|id| params.filter_ids.contains(&id.as_i64()));
        }

        let batch: Vec<SiteId> = sites.iter().skip(offset).take(params.limit).copied().collect();
        tracing::info!(
            offset,
            batch = batch.len(),
            total = sites.len(),
            "refreshing site information"
        );

        for site_id in &batch {
            if let Err(e) = self.source.refresh(*site_id, params.force).await {
                tracing::warn!(%site_id, error = %e, "site refresh failed, skipping");
            }
        }

        let next_offset = offset + batch.len();
        if next_offset >= sites.len() {
            state.remove(OFFSET_KEY);
            return Ok(Status::Ok);
        }

        state.set(OFFSET_KEY, next_offset)?;
        Ok(Status::WillResume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::TaskParams;
    use std::sync::Mutex;

    struct FakeSource {
        sites: Vec<SiteId>,
        refreshed: Mutex<Vec<(SiteId, bool)>>,
        fail_for: Option<SiteId>,
    }

    impl FakeSource {
        fn new(count: i64) -> Self {
            Self {
                sites: (1..=count).map(SiteId::new).collect(),
                refreshed: Mutex::new(Vec::new()),
                fail_for: None,
            }
        }
    }

    #[async_trait]
    impl SiteInfoSource for FakeSource {
        async fn site_ids(&self) -> Result<Vec<SiteId>, SiteInfoError> {
            Ok(self.sites.clone())
        }

        async fn refresh(&self, site_id: SiteId, force: bool) -> Result<(), SiteInfoError> {
            if self.fail_for == Some(site_id) {
                return Err(SiteInfoError("connection refused".into()));
            }
            self.refreshed.lock().unwrap().push((site_id, force));
            Ok(())
        }
    }

    fn params(limit: usize) -> TaskParams {
        TaskParams::new().with_value("limit", limit)
    }

    #[tokio::test]
    async fn test_refresh_batches_until_done() {
        let source = Arc::new(FakeSource::new(5));
        let callback = RefreshCallback::new(source.clone());

        let mut ctx = RunContext::new().with_params(params(2));
        let mut bag = StateBag::new();

        assert_eq!(
            callback.invoke(&mut ctx, &mut bag).await.unwrap(),
            Status::WillResume
        );
        assert_eq!(bag.get::<usize>(OFFSET_KEY).unwrap(), 2);

        assert_eq!(
            callback.invoke(&mut ctx, &mut bag).await.unwrap(),
            Status::WillResume
        );
        assert_eq!(bag.get::<usize>(OFFSET_KEY).unwrap(), 4);

        assert_eq!(
            callback.invoke(&mut ctx, &mut bag).await.unwrap(),
            Status::Ok
        );
        assert!(!bag.contains(OFFSET_KEY));
        assert_eq!(source.refreshed.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_filter_ids_restricts_sites() {
        let source = Arc::new(FakeSource::new(5));
        let callback = RefreshCallback::new(source.clone());

        let mut ctx = RunContext::new().with_params(
            params(10).with_value("filter_ids", serde_json::json!([2, 4])),
        );
        let mut bag = StateBag::new();

        assert_eq!(
            callback.invoke(&mut ctx, &mut bag).await.unwrap(),
            Status::Ok
        );
        let refreshed = source.refreshed.lock().unwrap();
        assert_eq!(refreshed.len(), 2);
        assert_eq!(refreshed[0].0, SiteId::new(2));
        assert_eq!(refreshed[1].0, SiteId::new(4));
    }

    #[tokio::test]
    async fn test_force_flag_is_forwarded() {
        let source = Arc::new(FakeSource::new(1));
        let callback = RefreshCallback::new(source.clone());

        let mut ctx = RunContext::new().with_params(params(10).with_value("force", true));
        let mut bag = StateBag::new();

        callback.invoke(&mut ctx, &mut bag).await.unwrap();
        assert!(source.refreshed.lock().unwrap()[0].1);
    }

    #[tokio::test]
    async fn test_failing_site_is_skipped() {
        let mut inner = FakeSource::new(3);
        inner.fail_for = Some(SiteId::new(2));
        let source = Arc::new(inner);
        let callback = RefreshCallback::new(source.clone());

        let mut ctx = RunContext::new().with_params(params(10));
        let mut bag = StateBag::new();

        assert_eq!(
            callback.invoke(&mut ctx, &mut bag).await.unwrap(),
            Status::Ok
        );
        assert_eq!(source.refreshed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_zero_batch_size_is_rejected() {
        let source = Arc::new(FakeSource::new(3));
        let callback = RefreshCallback::new(source);

        let mut ctx = RunContext::new().with_params(params(0));
        let mut bag = StateBag::new();
        let err = callback.invoke(&mut ctx, &mut bag).await.unwrap_err();
        assert!(matches!(err, CallbackError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_empty_site_list_completes_immediately() {
        let source = Arc::new(FakeSource::new(0));
        let callback = RefreshCallback::new(source);

        let mut ctx = RunContext::new().with_params(params(10));
        let mut bag = StateBag::new();
        assert_eq!(
            callback.invoke(&mut ctx, &mut bag).await.unwrap(),
            Status::Ok
        );
    }
}
