//! [`RunApi`] over HTTP.

use crate::api::{decode_runs, ApiError, ArtifactQuery, EventStream, RunApi, RunFilters, RunIntent};
use crate::config::EngineConfig;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use std::collections::VecDeque;
use std::time::Duration;
use telemetry_core::{LocaleId, Run, RunId};
use telemetry_progress::FrameDecoder;
use tracing::{debug, warn};

pub struct HttpRunApi {
    client: Client,
    base_url: Url,
    status_timeout: Duration,
    compute_timeout: Duration,
}

impl HttpRunApi {
    pub fn new(config: &EngineConfig) -> Result<Self, ApiError> {
        let base_url = Url::parse(config.base_url.trim())
            .map_err(|e| ApiError::Transport(format!("invalid base url: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::Transport(format!(
                "base url cannot carry paths: {base_url}"
            )));
        }
        let client = Client::builder()
            .user_agent(concat!("evac-telemetry/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            status_timeout: config.status_timeout(),
            compute_timeout: config.compute_timeout(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send(&self, request: RequestBuilder, timeout: Duration) -> Result<Response, ApiError> {
        request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))
    }

    async fn json<T: serde::de::DeserializeOwned>(
        response: Response,
        timeout: Duration,
    ) -> Result<T, ApiError> {
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Malformed(e.to_string()))
    }
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout(timeout)
    } else {
        ApiError::Transport(err.to_string())
    }
}

#[async_trait]
impl RunApi for HttpRunApi {
    async fn list_runs(&self, filters: &RunFilters) -> Result<Vec<Run>, ApiError> {
        let request = self.client.get(self.endpoint(&["runs"])).query(filters);
        let response = self.send(request, self.status_timeout).await?;
        let records: Vec<serde_json::Value> = Self::json(response, self.status_timeout).await?;
        let total = records.len();
        let runs = decode_runs(records);
        debug!(total, decoded = runs.len(), "run list fetched");
        Ok(runs)
    }

    async fn get_run(&self, run_id: &RunId) -> Result<Run, ApiError> {
        let request = self.client.get(self.endpoint(&["runs", &run_id.0]));
        let response = self.send(request, self.status_timeout).await?;
        Self::json(response, self.status_timeout).await
    }

    async fn get_artifact(
        &self,
        locale: &LocaleId,
        query: &ArtifactQuery,
    ) -> Result<Option<serde_json::Value>, ApiError> {
        let request = self
            .client
            .get(self.endpoint(&["artifacts", &locale.0]))
            .query(query);
        let response = self.send(request, self.compute_timeout).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::json(response, self.compute_timeout).await.map(Some)
    }

    async fn list_locales(&self) -> Result<Vec<LocaleId>, ApiError> {
        let request = self.client.get(self.endpoint(&["locales"]));
        let response = self.send(request, self.status_timeout).await?;
        let names: Vec<String> = Self::json(response, self.status_timeout).await?;
        Ok(names.into_iter().map(LocaleId).collect())
    }

    async fn start_run(&self, intent: &RunIntent) -> Result<EventStream, ApiError> {
        // No request timeout: the body is a long-lived stream whose silence
        // ceiling is enforced by the progress tracker.
        let response = self
            .client
            .post(self.endpoint(&["runs"]))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(intent)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }
        let bytes = response
            .bytes_stream()
            .map_err(|e| ApiError::Transport(e.to_string()))
            .boxed();
        Ok(frame_events(bytes))
    }
}

/// Turn a stream of raw byte chunks into decoded progress events.
pub fn frame_events<S, B>(bytes: S) -> EventStream
where
    S: futures::Stream<Item = Result<B, ApiError>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = (bytes, FrameDecoder::new(), VecDeque::new(), false);
    futures::stream::unfold(state, |(mut bytes, mut decoder, mut pending, mut done)| async move {
        loop {
            if let Some(event) = pending.pop_front() {
                return Some((Ok(event), (bytes, decoder, pending, done)));
            }
            if done {
                return None;
            }
            match bytes.next().await {
                Some(Ok(chunk)) => pending.extend(decoder.push(chunk.as_ref())),
                Some(Err(err)) => {
                    warn!(error = %err, "progress stream broke");
                    return Some((Err(err), (bytes, decoder, pending, true)));
                }
                None => {
                    pending.extend(decoder.finish());
                    if decoder.skipped() > 0 {
                        debug!(skipped = decoder.skipped(), "progress stream ended with skipped frames");
                    }
                    done = true;
                }
            }
        }
    })
    .boxed()
}
