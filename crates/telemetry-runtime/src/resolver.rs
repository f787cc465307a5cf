//! Tiered artifact resolution.
//!
//! A lookup walks an ordered cascade (exact-key cache, authoritative service,
//! newest cached record of the same locale) and stops at the first tier that
//! yields a record carrying the expected engine tag. Records from any other
//! engine are never served. Concurrent lookups for one key share a single
//! in-flight cascade.

use crate::api::{ApiError, ArtifactQuery, RunApi};
use crate::cache::ArtifactCache;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use telemetry_core::{ArtifactKey, ArtifactRecord, FailureKind, LocaleId, RunId, SourceTier};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Cascade order. Earlier tiers win.
pub const CASCADE: [SourceTier; 3] = [SourceTier::Cache, SourceTier::Authoritative, SourceTier::Related];

#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    Found(ArtifactRecord),
    /// Nothing servable. `stale_engine` is set when records existed but all
    /// came from another engine.
    NotAvailable { stale_engine: bool },
}

impl Resolution {
    pub fn record(&self) -> Option<&ArtifactRecord> {
        match self {
            Resolution::Found(record) => Some(record),
            Resolution::NotAvailable { .. } => None,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
#[error("artifact resolution failed (transient: {transient}): {message}")]
pub struct ResolutionError {
    pub transient: bool,
    pub kind: FailureKind,
    pub message: String,
}

impl ResolutionError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            transient: true,
            kind: FailureKind::TransientNetwork,
            message: message.into(),
        }
    }

    /// The artifact body could not be decoded.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            transient: false,
            kind: FailureKind::MalformedPayload,
            message: message.into(),
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        self.kind
    }
}

impl From<ApiError> for ResolutionError {
    fn from(err: ApiError) -> Self {
        Self {
            transient: err.is_transient(),
            kind: err.failure_kind(),
            message: err.to_string(),
        }
    }
}

/// Result of consulting one tier.
#[derive(Clone, Debug, PartialEq)]
pub enum TierOutcome {
    Valid(ArtifactRecord),
    /// A record existed but was produced by another engine.
    Stale,
    Absent,
    Error(ResolutionError),
}

/// One artifact lookup.
#[derive(Clone, Debug, PartialEq)]
pub struct ArtifactRequest {
    pub locale: LocaleId,
    pub run_id: Option<RunId>,
    /// Skip the exact-key cache and ask the service to recompute.
    pub force_refresh: bool,
    /// Skip the exact-key cache but accept whatever the service has.
    pub skip_cache: bool,
}

impl ArtifactRequest {
    pub fn new(locale: LocaleId, run_id: Option<RunId>) -> Self {
        Self {
            locale,
            run_id,
            force_refresh: false,
            skip_cache: false,
        }
    }

    pub fn forced(mut self) -> Self {
        self.force_refresh = true;
        self.skip_cache = true;
        self
    }

    /// Go to the service first without forcing a recompute.
    pub fn revalidated(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    pub fn key(&self) -> ArtifactKey {
        ArtifactKey::new(&self.locale, self.run_id.clone())
    }

    // Only requests asking for the same freshness may share a cascade.
    fn inflight_key(&self) -> InflightKey {
        (self.key(), self.skip_cache, self.force_refresh)
    }
}

type InflightKey = (ArtifactKey, bool, bool);

/// Wire shape of an artifact body.
#[derive(Deserialize)]
struct ArtifactEnvelope {
    #[serde(default, alias = "engine")]
    engine_tag: Option<String>,
    payload: serde_json::Value,
}

type SharedResolution = Shared<BoxFuture<'static, Result<Resolution, ResolutionError>>>;

#[derive(Clone)]
pub struct ArtifactResolver {
    inner: Arc<Inner>,
}

struct Inner {
    api: Arc<dyn RunApi>,
    cache: Arc<ArtifactCache>,
    expected_tag: String,
    compute_timeout: Duration,
    inflight: Mutex<HashMap<InflightKey, SharedResolution>>,
}

impl ArtifactResolver {
    pub fn new(
        api: Arc<dyn RunApi>,
        cache: Arc<ArtifactCache>,
        expected_tag: impl Into<String>,
        compute_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                cache,
                expected_tag: expected_tag.into(),
                compute_timeout,
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.inner.cache
    }

    pub fn expected_tag(&self) -> &str {
        &self.inner.expected_tag
    }

    pub async fn resolve(
        &self,
        locale: &LocaleId,
        run_id: Option<RunId>,
    ) -> Result<Resolution, ResolutionError> {
        self.resolve_request(ArtifactRequest::new(locale.clone(), run_id))
            .await
    }

    /// Resolve, joining any cascade already running for the same key and
    /// freshness.
    pub async fn resolve_request(
        &self,
        request: ArtifactRequest,
    ) -> Result<Resolution, ResolutionError> {
        let key = request.inflight_key();
        let shared = {
            let mut inflight = self.inner.inflight.lock().await;
            match inflight.get(&key) {
                Some(existing) => {
                    debug!(key = %key.0, forced = key.2, "joining in-flight resolution");
                    existing.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    let cascade: BoxFuture<'static, _> =
                        async move { inner.cascade(&request).await }.boxed();
                    let shared = cascade.shared();
                    inflight.insert(key.clone(), shared.clone());
                    shared
                }
            }
        };
        let result = shared.clone().await;
        let mut inflight = self.inner.inflight.lock().await;
        if inflight
            .get(&key)
            .is_some_and(|current| current.ptr_eq(&shared))
        {
            inflight.remove(&key);
        }
        result
    }

    /// Consult a single tier without walking the cascade.
    pub async fn run_tier(&self, tier: SourceTier, request: &ArtifactRequest) -> TierOutcome {
        self.inner.tier(tier, request).await
    }
}

impl Inner {
    async fn cascade(&self, request: &ArtifactRequest) -> Result<Resolution, ResolutionError> {
        let key = request.key();
        let mut stale = false;
        let mut deferred: Option<ResolutionError> = None;
        for tier in CASCADE {
            match self.tier(tier, request).await {
                TierOutcome::Valid(record) => {
                    debug!(key = %key, tier = ?tier, "artifact resolved");
                    return Ok(Resolution::Found(record));
                }
                TierOutcome::Stale => stale = true,
                TierOutcome::Absent => {}
                TierOutcome::Error(err) => {
                    warn!(key = %key, tier = ?tier, error = %err, "artifact tier failed");
                    deferred.get_or_insert(err);
                }
            }
        }
        if let Some(err) = deferred {
            return Err(err);
        }
        if stale {
            info!(key = %key, expected = %self.expected_tag, "only artifacts from another engine exist");
        }
        Ok(Resolution::NotAvailable {
            stale_engine: stale,
        })
    }

    async fn tier(&self, tier: SourceTier, request: &ArtifactRequest) -> TierOutcome {
        match tier {
            SourceTier::Cache => self.from_cache(request).await,
            SourceTier::Authoritative => self.from_service(request).await,
            SourceTier::Related => self.from_related(request).await,
        }
    }

    async fn from_cache(&self, request: &ArtifactRequest) -> TierOutcome {
        if request.skip_cache || request.force_refresh {
            return TierOutcome::Absent;
        }
        let key = request.key();
        match self.cache.get(&key).await {
            None => TierOutcome::Absent,
            Some(record) if record.is_valid(&self.expected_tag) => {
                TierOutcome::Valid(record.with_tier(SourceTier::Cache))
            }
            Some(record) => {
                warn!(key = %key, found = %record.engine_tag, expected = %self.expected_tag, "cached artifact from another engine");
                self.cache.evict_invalid(&key, &self.expected_tag).await;
                TierOutcome::Stale
            }
        }
    }

    async fn from_service(&self, request: &ArtifactRequest) -> TierOutcome {
        let query = ArtifactQuery {
            force_refresh: request.force_refresh,
            run_id: request.run_id.clone(),
        };
        let fetched = tokio::time::timeout(
            self.compute_timeout,
            self.api.get_artifact(&request.locale, &query),
        )
        .await;
        let body = match fetched {
            Err(_) => {
                return TierOutcome::Error(ApiError::Timeout(self.compute_timeout).into());
            }
            Ok(Err(err)) => return TierOutcome::Error(err.into()),
            Ok(Ok(None)) => return TierOutcome::Absent,
            Ok(Ok(Some(body))) => body,
        };
        let envelope: ArtifactEnvelope = match serde_json::from_value(body) {
            Ok(envelope) => envelope,
            Err(err) => {
                return TierOutcome::Error(ResolutionError::malformed(format!(
                    "malformed artifact: {err}"
                )));
            }
        };
        if envelope.payload.is_null() {
            return TierOutcome::Error(ResolutionError::malformed("artifact payload is null"));
        }
        let tag = envelope.engine_tag.unwrap_or_default();
        if tag != self.expected_tag {
            warn!(locale = %request.locale, found = %tag, expected = %self.expected_tag, "service returned artifact from another engine");
            return TierOutcome::Stale;
        }
        let record = ArtifactRecord {
            engine_tag: tag,
            payload: envelope.payload,
            fetched_at: Utc::now(),
            source_tier: SourceTier::Authoritative,
        };
        self.cache.replace(request.key(), record.clone()).await;
        TierOutcome::Valid(record)
    }

    async fn from_related(&self, request: &ArtifactRequest) -> TierOutcome {
        let (newest, evicted) = self
            .cache
            .latest_related(&request.key(), &self.expected_tag)
            .await;
        match newest {
            Some(record) => TierOutcome::Valid(record.with_tier(SourceTier::Related)),
            None if evicted > 0 => TierOutcome::Stale,
            None => TierOutcome::Absent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeApi;
    use serde_json::json;

    const TAG: &str = "behavioral-v2";

    fn camden() -> LocaleId {
        LocaleId("Camden".into())
    }

    fn record(tag: &str) -> ArtifactRecord {
        ArtifactRecord {
            engine_tag: tag.into(),
            payload: json!({"routes": []}),
            fetched_at: Utc::now(),
            source_tier: SourceTier::Authoritative,
        }
    }

    fn resolver(api: &Arc<FakeApi>) -> ArtifactResolver {
        ArtifactResolver::new(
            api.clone(),
            Arc::new(ArtifactCache::new()),
            TAG,
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn valid_cache_hit_skips_the_service() {
        let api = Arc::new(FakeApi::default());
        let r = resolver(&api);
        r.cache()
            .replace(ArtifactKey::new(&camden(), None), record(TAG))
            .await;
        let res = r.resolve(&camden(), None).await.unwrap();
        assert_eq!(res.record().unwrap().source_tier, SourceTier::Cache);
        assert_eq!(api.artifact_calls(), 0);
    }

    #[tokio::test]
    async fn wrong_engine_in_cache_falls_through_to_service() {
        let api = Arc::new(FakeApi::default());
        api.set_artifact(&camden(), Ok(Some(json!({"engine_tag": TAG, "payload": {"routes": [1]}}))));
        let r = resolver(&api);
        let key = ArtifactKey::new(&camden(), None);
        r.cache().replace(key.clone(), record("legacy-v1")).await;

        let res = r.resolve(&camden(), None).await.unwrap();
        let found = res.record().unwrap();
        assert_eq!(found.source_tier, SourceTier::Authoritative);
        assert_eq!(found.payload, json!({"routes": [1]}));
        assert_eq!(api.artifact_calls(), 1);
        assert_eq!(r.cache().get(&key).await.unwrap().engine_tag, TAG);
    }

    #[tokio::test]
    async fn every_tier_from_another_engine_is_not_available() {
        let api = Arc::new(FakeApi::default());
        api.set_artifact(&camden(), Ok(Some(json!({"engine": "legacy-v1", "payload": {}}))));
        let r = resolver(&api);
        r.cache()
            .replace(ArtifactKey::new(&camden(), None), record("legacy-v1"))
            .await;
        r.cache()
            .replace(
                ArtifactKey::new(&camden(), Some(RunId("r-1".into()))),
                record("legacy-v1"),
            )
            .await;

        let res = r.resolve(&camden(), None).await.unwrap();
        assert_eq!(res, Resolution::NotAvailable { stale_engine: true });
        assert!(r.cache().is_empty().await);
    }

    #[tokio::test]
    async fn untagged_artifact_is_never_served() {
        let api = Arc::new(FakeApi::default());
        api.set_artifact(&camden(), Ok(Some(json!({"payload": {"routes": []}}))));
        let r = resolver(&api);
        let res = r.resolve(&camden(), None).await.unwrap();
        assert_eq!(res, Resolution::NotAvailable { stale_engine: true });
    }

    #[tokio::test]
    async fn nothing_anywhere_is_not_available() {
        let api = Arc::new(FakeApi::default());
        let r = resolver(&api);
        let res = r.resolve(&camden(), None).await.unwrap();
        assert_eq!(res, Resolution::NotAvailable { stale_engine: false });
    }

    #[tokio::test]
    async fn malformed_payload_is_a_permanent_error() {
        let api = Arc::new(FakeApi::default());
        api.set_artifact(&camden(), Ok(Some(json!({"engine_tag": TAG}))));
        let err = resolver(&api).resolve(&camden(), None).await.unwrap_err();
        assert!(!err.transient);
        assert_eq!(err.failure_kind(), FailureKind::MalformedPayload);
    }

    #[tokio::test]
    async fn transport_failure_is_transient() {
        let api = Arc::new(FakeApi::default());
        api.set_artifact(&camden(), Err(ApiError::Transport("connection refused".into())));
        let err = resolver(&api).resolve(&camden(), None).await.unwrap_err();
        assert!(err.transient);
    }

    #[tokio::test]
    async fn refused_request_keeps_its_own_failure_kind() {
        let api = Arc::new(FakeApi::default());
        api.set_artifact(&camden(), Err(ApiError::Status(403)));
        let err = resolver(&api).resolve(&camden(), None).await.unwrap_err();
        assert!(!err.transient);
        assert_eq!(err.failure_kind(), FailureKind::ServiceRejected);
    }

    #[tokio::test]
    async fn related_record_covers_a_failing_service() {
        let api = Arc::new(FakeApi::default());
        api.set_artifact(&camden(), Err(ApiError::Status(503)));
        let r = resolver(&api);
        r.cache()
            .replace(
                ArtifactKey::new(&camden(), Some(RunId("r-1".into()))),
                record(TAG),
            )
            .await;
        let res = r.resolve(&camden(), None).await.unwrap();
        assert_eq!(res.record().unwrap().source_tier, SourceTier::Related);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_service_times_out_as_transient() {
        let api = Arc::new(FakeApi::default());
        api.set_artifact(&camden(), Ok(Some(json!({"engine_tag": TAG, "payload": {}}))));
        api.set_artifact_delay(Duration::from_secs(600));
        let err = resolver(&api).resolve(&camden(), None).await.unwrap_err();
        assert!(err.transient);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_lookups_share_one_fetch() {
        let api = Arc::new(FakeApi::default());
        api.set_artifact(&camden(), Ok(Some(json!({"engine_tag": TAG, "payload": {"n": 1}}))));
        api.set_artifact_delay(Duration::from_secs(5));
        let r = resolver(&api);

        let (upper, lower) = (camden(), LocaleId("camden".into()));
        let (a, b) = tokio::join!(r.resolve(&upper, None), r.resolve(&lower, None));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(api.artifact_calls(), 1);

        // Settled lookups are served from cache afterwards.
        let again = r.resolve(&camden(), None).await.unwrap();
        assert_eq!(again.record().unwrap().source_tier, SourceTier::Cache);
        assert_eq!(api.artifact_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_lookup_does_not_join_an_unforced_one() {
        let api = Arc::new(FakeApi::default());
        api.set_artifact(&camden(), Ok(Some(json!({"engine_tag": TAG, "payload": {}}))));
        api.set_artifact_delay(Duration::from_secs(5));
        let r = resolver(&api);
        let locale = camden();

        let plain = r.resolve(&locale, None);
        let forced = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            r.resolve_request(ArtifactRequest::new(camden(), None).forced())
                .await
        };
        let (a, b) = tokio::join!(plain, forced);
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(api.artifact_calls(), 2);
        assert!(api.last_artifact_query().unwrap().force_refresh);
    }

    #[tokio::test]
    async fn revalidation_skips_the_cache_without_forcing() {
        let api = Arc::new(FakeApi::default());
        api.set_artifact(&camden(), Ok(Some(json!({"engine_tag": TAG, "payload": {"v": 2}}))));
        let r = resolver(&api);
        r.cache()
            .replace(ArtifactKey::new(&camden(), None), record(TAG))
            .await;
        let res = r
            .resolve_request(ArtifactRequest::new(camden(), None).revalidated())
            .await
            .unwrap();
        let record = res.record().unwrap();
        assert_eq!(record.source_tier, SourceTier::Authoritative);
        assert_eq!(record.payload, json!({"v": 2}));
        assert!(!api.last_artifact_query().unwrap().force_refresh);
    }

    #[tokio::test]
    async fn forced_refresh_bypasses_the_cache() {
        let api = Arc::new(FakeApi::default());
        api.set_artifact(&camden(), Ok(Some(json!({"engine_tag": TAG, "payload": {"fresh": true}}))));
        let r = resolver(&api);
        r.cache()
            .replace(ArtifactKey::new(&camden(), None), record(TAG))
            .await;
        let res = r
            .resolve_request(ArtifactRequest::new(camden(), None).forced())
            .await
            .unwrap();
        assert_eq!(res.record().unwrap().payload, json!({"fresh": true}));
        assert!(api.last_artifact_query().unwrap().force_refresh);
    }

    #[tokio::test]
    async fn tiers_are_individually_testable() {
        let api = Arc::new(FakeApi::default());
        let r = resolver(&api);
        let req = ArtifactRequest::new(camden(), None);
        assert_eq!(r.run_tier(SourceTier::Cache, &req).await, TierOutcome::Absent);
        r.cache().replace(req.key(), record("legacy-v1")).await;
        assert_eq!(r.run_tier(SourceTier::Cache, &req).await, TierOutcome::Stale);
        assert_eq!(r.run_tier(SourceTier::Related, &req).await, TierOutcome::Absent);
    }
}
