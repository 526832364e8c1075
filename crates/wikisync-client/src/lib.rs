//! Remote wiki API plumbing: paginated table pulls and resource lookups
//! bounded by a wall-clock budget.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use wikisync_core::{FieldSelector, RawApiRecord};

pub const CRATE_NAME: &str = "wikisync-client";

pub const DEFAULT_API_URL: &str = "https://www.poewiki.net/w/api.php";

/// One page request against the `cargoquery` action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CargoQuery {
    pub table: String,
    pub fields: Vec<FieldSelector>,
    pub limit: usize,
    pub offset: usize,
}

impl CargoQuery {
    pub fn joined_fields(&self) -> String {
        join_fields(&self.fields)
    }

    pub fn params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("action", "cargoquery".to_string()),
            ("format", "json".to_string()),
            ("tables", self.table.clone()),
            ("fields", self.joined_fields()),
            ("limit", self.limit.to_string()),
            ("offset", self.offset.to_string()),
        ]
    }
}

pub fn image_info_params(reference: &str) -> Vec<(&'static str, String)> {
    vec![
        ("action", "query".to_string()),
        ("format", "json".to_string()),
        ("titles", reference.to_string()),
        ("prop", "imageinfo".to_string()),
        ("iiprop", "url".to_string()),
    ]
}

fn join_fields(fields: &[FieldSelector]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Deserialize)]
struct CargoQueryResponse {
    cargoquery: Vec<RawApiRecord>,
}

#[derive(Debug, Deserialize)]
struct ImageInfoResponse {
    query: ImageInfoQuery,
}

#[derive(Debug, Deserialize)]
struct ImageInfoQuery {
    pages: Map<String, JsonValue>,
}

#[derive(Debug, Deserialize)]
struct ImageInfoPage {
    #[serde(default)]
    imageinfo: Vec<ImageInfo>,
}

#[derive(Debug, Deserialize)]
struct ImageInfo {
    url: String,
}

impl ImageInfoResponse {
    fn first_url(self) -> Result<Option<String>, TransportError> {
        let Some(page) = self.query.pages.into_iter().next().map(|(_, page)| page) else {
            return Ok(None);
        };
        let page: ImageInfoPage =
            serde_json::from_value(page).map_err(|e| TransportError::Decode(e.to_string()))?;
        Ok(page.imageinfo.into_iter().next().map(|info| info.url))
    }
}

/// Failure of a single request. Always treated as transient by the pull loops.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unexpected response body: {0}")]
    Decode(String),
}

/// The two remote calls the pipeline needs.
#[async_trait]
pub trait WikiApi: Send + Sync {
    async fn cargo_query(&self, query: &CargoQuery) -> Result<Vec<RawApiRecord>, TransportError>;

    /// URL of the first image-info result for `reference`, `None` when the
    /// lookup succeeded but the remote has no such resource.
    async fn image_info(&self, reference: &str) -> Result<Option<String>, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub api_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpWikiApi {
    client: reqwest::Client,
    api_url: String,
}

impl HttpWikiApi {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            api_url: config.api_url,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        params: &[(&'static str, String)],
    ) -> Result<T, TransportError> {
        let resp = self.client.get(&self.api_url).query(params).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

#[async_trait]
impl WikiApi for HttpWikiApi {
    async fn cargo_query(&self, query: &CargoQuery) -> Result<Vec<RawApiRecord>, TransportError> {
        let response: CargoQueryResponse = self.get_json(&query.params()).await?;
        Ok(response.cargoquery)
    }

    async fn image_info(&self, reference: &str) -> Result<Option<String>, TransportError> {
        let response: ImageInfoResponse = self.get_json(&image_info_params(reference)).await?;
        response.first_url()
    }
}

/// `delay(n) = base_delay * factor^n`, uncapped; the time budget bounds it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            factor: 1.5,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_count: u32) -> Duration {
        let exponent = i32::try_from(attempt_count).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    pub page_size: usize,
    pub time_budget: Duration,
    /// Pause between successful pages.
    pub page_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            page_size: 200,
            time_budget: Duration::from_secs(300),
            page_delay: Duration::from_millis(50),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResolvePolicy {
    pub time_budget: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for ResolvePolicy {
    fn default() -> Self {
        Self {
            time_budget: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Last known state of a pull that ran out of time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullDiagnostics {
    /// Remote table name, or the resource reference for a lookup.
    pub target: String,
    pub fields: String,
    pub offset: usize,
    /// Retries already performed when the budget ran out.
    pub attempt_count: u32,
    pub elapsed: Duration,
    pub budget: Duration,
}

impl fmt::Display for PullDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "target `{}`, fields [{}], offset {}, {} retries, {:?} elapsed of {:?} budget",
            self.target, self.fields, self.offset, self.attempt_count, self.elapsed, self.budget
        )
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// `source` is the last transport error, or `None` when the budget ran
    /// out between successful pages.
    #[error(
        "time budget exceeded ({diagnostics}){}",
        .source.as_ref().map(|e| format!(": {e}")).unwrap_or_default()
    )]
    FetchTimeExceeded {
        diagnostics: PullDiagnostics,
        #[source]
        source: Option<TransportError>,
    },
}

impl FetchError {
    pub fn diagnostics(&self) -> &PullDiagnostics {
        match self {
            Self::FetchTimeExceeded { diagnostics, .. } => diagnostics,
        }
    }
}

/// Wall-clock deadline shared by one pull's retries.
#[derive(Debug, Clone, Copy)]
struct RetryClock {
    started: Instant,
    budget: Duration,
    backoff: BackoffPolicy,
}

impl RetryClock {
    fn start(budget: Duration, backoff: BackoffPolicy) -> Self {
        Self {
            started: Instant::now(),
            budget,
            backoff,
        }
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Delay before the next attempt, or `None` when sleeping it would
    /// overrun the budget.
    fn plan_retry(&self, attempt_count: u32) -> Option<Duration> {
        let delay = self.backoff.delay_for_attempt(attempt_count);
        self.can_wait(delay).then_some(delay)
    }

    /// Whether sleeping `pause` still wakes up inside the budget.
    fn can_wait(&self, pause: Duration) -> bool {
        let Some(deadline) = self.started.checked_add(self.budget) else {
            return true;
        };
        matches!(Instant::now().checked_add(pause), Some(wake_at) if wake_at <= deadline)
    }
}

/// Per-call pull state; never stored on the fetcher.
#[derive(Debug)]
struct PullState {
    offset: usize,
    attempt_count: u32,
    clock: RetryClock,
    accumulated: Vec<RawApiRecord>,
}

#[derive(Clone)]
pub struct RemoteTableFetcher {
    api: Arc<dyn WikiApi>,
    policy: FetchPolicy,
}

impl RemoteTableFetcher {
    pub fn new(api: Arc<dyn WikiApi>, policy: FetchPolicy) -> Self {
        let policy = FetchPolicy {
            page_size: policy.page_size.max(1),
            ..policy
        };
        Self { api, policy }
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Pulls every row of `table`, page by page, until a short page arrives.
    pub async fn fetch(
        &self,
        table: &str,
        fields: &[FieldSelector],
    ) -> Result<Vec<RawApiRecord>, FetchError> {
        let span = info_span!("table_pull", table, page_size = self.policy.page_size);
        self.pull(table, fields).instrument(span).await
    }

    async fn pull(
        &self,
        table: &str,
        fields: &[FieldSelector],
    ) -> Result<Vec<RawApiRecord>, FetchError> {
        let page_size = self.policy.page_size;
        let mut state = PullState {
            offset: 0,
            attempt_count: 0,
            clock: RetryClock::start(self.policy.time_budget, self.policy.backoff),
            accumulated: Vec::new(),
        };

        loop {
            let query = CargoQuery {
                table: table.to_string(),
                fields: fields.to_vec(),
                limit: page_size,
                offset: state.offset,
            };

            match self.api.cargo_query(&query).await {
                Ok(records) => {
                    let returned = records.len();
                    state.accumulated.extend(records);
                    state.offset += returned;
                    debug!(offset = state.offset, returned, "page received");

                    if returned < page_size {
                        info!(
                            rows = state.accumulated.len(),
                            retries = state.attempt_count,
                            elapsed_ms = state.clock.elapsed().as_millis() as u64,
                            "table pull complete"
                        );
                        return Ok(state.accumulated);
                    }
                    if !state.clock.can_wait(self.policy.page_delay) {
                        warn!(
                            offset = state.offset,
                            rows = state.accumulated.len(),
                            "time budget exhausted between full pages"
                        );
                        return Err(self.time_exceeded(table, &query, &state, None));
                    }
                    if !self.policy.page_delay.is_zero() {
                        tokio::time::sleep(self.policy.page_delay).await;
                    }
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        fields = %query.joined_fields(),
                        offset = state.offset,
                        page_size,
                        attempt = state.attempt_count,
                        "wiki api pull failed"
                    );
                    let Some(delay) = state.clock.plan_retry(state.attempt_count) else {
                        return Err(self.time_exceeded(table, &query, &state, Some(err)));
                    };
                    debug!(delay_ms = delay.as_millis() as u64, "backing off");
                    tokio::time::sleep(delay).await;
                    state.attempt_count += 1;
                }
            }
        }
    }
}

impl RemoteTableFetcher {
    fn time_exceeded(
        &self,
        table: &str,
        query: &CargoQuery,
        state: &PullState,
        source: Option<TransportError>,
    ) -> FetchError {
        FetchError::FetchTimeExceeded {
            diagnostics: PullDiagnostics {
                target: table.to_string(),
                fields: query.joined_fields(),
                offset: state.offset,
                attempt_count: state.attempt_count,
                elapsed: state.clock.elapsed(),
                budget: self.policy.time_budget,
            },
            source,
        }
    }
}

/// Resolves resource references (file names) to canonical URLs.
#[derive(Clone)]
pub struct ResourceUrlResolver {
    api: Arc<dyn WikiApi>,
    policy: ResolvePolicy,
}

impl ResourceUrlResolver {
    pub fn new(api: Arc<dyn WikiApi>, policy: ResolvePolicy) -> Self {
        Self { api, policy }
    }

    /// Callers skip empty references; this always performs a lookup.
    pub async fn resolve(&self, reference: &str) -> Result<Option<String>, FetchError> {
        let span = info_span!("resource_lookup", reference);
        self.lookup(reference).instrument(span).await
    }

    async fn lookup(&self, reference: &str) -> Result<Option<String>, FetchError> {
        let clock = RetryClock::start(self.policy.time_budget, self.policy.backoff);
        let mut attempt_count = 0u32;

        loop {
            match self.api.image_info(reference).await {
                Ok(url) => {
                    if url.is_none() {
                        warn!("remote has no image info for reference");
                    }
                    return Ok(url);
                }
                Err(err) => {
                    warn!(error = %err, attempt = attempt_count, "resource lookup failed");
                    let Some(delay) = clock.plan_retry(attempt_count) else {
                        return Err(FetchError::FetchTimeExceeded {
                            diagnostics: PullDiagnostics {
                                target: reference.to_string(),
                                fields: "imageinfo.url".to_string(),
                                offset: 0,
                                attempt_count,
                                elapsed: clock.elapsed(),
                                budget: self.policy.time_budget,
                            },
                            source: Some(err),
                        });
                    };
                    tokio::time::sleep(delay).await;
                    attempt_count += 1;
                }
            }
        }
    }
}
