// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Fetch pipeline: HTTP body → multipart parser → reducer → record channel.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use replay_core::{
    IncrementalReducer, Producer, RequestExecutor, RequestRecord, RequestRegistry, Role,
    Subscription,
};
use replay_multipart::{is_multipart, MultipartError, PatchResolver};
use replay_proto::{DeliveryEvent, ErrorPayload, ExecutionResult, OperationDescriptor};
use tracing::{debug, info, warn};

use crate::abort::AbortSignal;
use crate::config::{NetworkConfig, ACCEPT};
use crate::fetch::{FetchError, FetchRequest, Fetcher};

/// Executes requests against one registry, deduplicating by request key.
///
/// * a record nobody is producing and that holds nothing is claimed and fetched
/// * anything else (a live fetch, an in-flight handoff, a finished response)
///   is replayed from the record's channel
///
/// On an origin registry every fetched request is also announced for the
/// handoff.
#[derive(Clone)]
pub struct ReplayNetwork {
    config: NetworkConfig,
    registry: Arc<RequestRegistry>,
    fetcher: Arc<dyn Fetcher>,
}

impl fmt::Debug for ReplayNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayNetwork")
            .field("config", &self.config)
            .field("role", &self.registry.role())
            .finish_non_exhaustive()
    }
}

impl ReplayNetwork {
    /// Network over `registry`, sending requests through `fetcher`.
    pub fn new(
        config: NetworkConfig,
        registry: Arc<RequestRegistry>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            config,
            registry,
            fetcher,
        }
    }

    /// Network backed by a default [`ReqwestFetcher`](crate::ReqwestFetcher).
    #[cfg(feature = "reqwest")]
    pub fn with_reqwest(config: NetworkConfig, registry: Arc<RequestRegistry>) -> Self {
        Self::new(
            config,
            registry,
            Arc::new(crate::fetch::ReqwestFetcher::new()),
        )
    }

    /// Active settings.
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Registry requests are deduplicated against.
    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    /// Start (or join) `operation`.
    ///
    /// The returned subscription yields the same ordered events whether this
    /// call fetched or replayed. `signal` only applies when this call ends up
    /// fetching. Must be called inside a tokio runtime.
    pub fn execute(
        &self,
        operation: &OperationDescriptor,
        signal: Option<AbortSignal>,
    ) -> Subscription<DeliveryEvent> {
        let record = self.registry.build(operation);
        if !record.try_claim(Producer::Fetching) {
            debug!(key = %record.key(), producer = ?record.producer(), "replaying request");
            return record.subscribe();
        }
        let events = record.subscribe();
        if self.registry.role() == Role::Origin {
            match self.registry.watch(&record) {
                Ok(id) => debug!(key = %record.key(), %id, "request watched for handoff"),
                Err(err) => warn!(key = %record.key(), error = %err, "request not watched"),
            }
        }
        let network = self.clone();
        tokio::spawn(async move { network.run(record, signal).await });
        events
    }

    async fn run(self, record: RequestRecord, signal: Option<AbortSignal>) {
        let key = record.key().clone();
        info!(%key, url = %self.config.url, "fetch started");
        let outcome = match signal {
            Some(signal) if signal.is_aborted() => Err(ErrorPayload::aborted()),
            Some(signal) => tokio::select! {
                res = self.fetch_into(&record) => res,
                () = signal.aborted() => Err(ErrorPayload::aborted()),
            },
            None => self.fetch_into(&record).await,
        };
        match outcome {
            Ok(()) => {
                record.complete();
                info!(%key, "fetch finished");
            }
            Err(error) => {
                warn!(%key, code = %error.name, message = %error.message, "fetch failed");
                record.fail(error);
            }
        }
    }

    async fn fetch_into(&self, record: &RequestRecord) -> Result<(), ErrorPayload> {
        let request = self.request_for(record.operation())?;
        let response = self
            .fetcher
            .fetch(request)
            .await
            .map_err(|e| e.to_payload())?;
        let max = self.config.max_frame_bytes;

        if !(200..300).contains(&response.status) {
            let body = read_body(response.body, max).await.map_or_else(
                |e| e.to_string(),
                |bytes| String::from_utf8_lossy(&bytes).into_owned(),
            );
            return Err(FetchError::Http {
                status: response.status,
                body,
            }
            .to_payload());
        }

        let content_type = response.content_type.unwrap_or_default();
        let mut reducer = IncrementalReducer::new();
        if !is_multipart(&content_type) {
            let bytes = read_body(response.body, max)
                .await
                .map_err(|e| e.to_payload())?;
            let result: ExecutionResult = serde_json::from_slice(&bytes)
                .map_err(|e| ErrorPayload::parse(format!("invalid json response: {e}")))?;
            return deliver(&mut reducer, record, std::slice::from_ref(&result));
        }

        let mut parser: PatchResolver<ExecutionResult> =
            PatchResolver::from_content_type(&content_type);
        let mut body = response.body;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| e.to_payload())?;
            let parts = parser.handle_chunk(chunk).map_err(part_error)?;
            if parser.buffered_len() > max {
                return Err(ErrorPayload::transport(format!(
                    "multipart part exceeds {max} bytes"
                )));
            }
            deliver(&mut reducer, record, &parts)?;
            if parser.is_closed() {
                break;
            }
        }
        let dropped = parser.finish().map_err(part_error)?;
        if dropped > 0 {
            warn!(key = %record.key(), dropped, "multipart body ended inside a part");
        }
        Ok(())
    }

    fn request_for(&self, operation: &OperationDescriptor) -> Result<FetchRequest, ErrorPayload> {
        let body = serde_json::to_vec(&operation.request_body())
            .map_err(|e| ErrorPayload::transport(format!("cannot encode request: {e}")))?;
        let mut headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("accept".to_string(), ACCEPT.to_string()),
        ];
        headers.extend(
            self.config
                .headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone())),
        );
        Ok(FetchRequest {
            url: self.config.url.clone(),
            method: self.config.method.clone(),
            headers,
            body: Bytes::from(body),
        })
    }
}

impl RequestExecutor for ReplayNetwork {
    fn execute_operation(&self, operation: OperationDescriptor) {
        drop(self.execute(&operation, None));
    }
}

fn part_error(err: MultipartError) -> ErrorPayload {
    match err {
        MultipartError::Json(_) => ErrorPayload::parse(err.to_string()),
        MultipartError::MalformedPart => ErrorPayload::transport(err.to_string()),
    }
}

fn deliver(
    reducer: &mut IncrementalReducer,
    record: &RequestRecord,
    results: &[ExecutionResult],
) -> Result<(), ErrorPayload> {
    if results.is_empty() {
        return Ok(());
    }
    reducer
        .on_next(results, |event| {
            record.emit(event);
        })
        .map_err(|e| ErrorPayload::shape(e.to_string()))
}

async fn read_body(
    mut body: BoxStream<'static, Result<Bytes, FetchError>>,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let mut out = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        if out.len() + chunk.len() > limit {
            return Err(FetchError::MalformedResponse(format!(
                "response body exceeds {limit} bytes"
            )));
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}
