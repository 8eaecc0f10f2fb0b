//! JSON-RPC client pool shared by every ingestion worker.
//!
//! One pool governs the request budget for the whole process: a semaphore
//! caps in-flight requests and a pacing slot spaces them out, so workers
//! cannot stampede a rate-limited provider. Transient failures rotate to the
//! next endpoint and back off exponentially.

use crate::error::{PipelineError, Result};
use ethers::types::{Filter, Log, U256, U64};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};
use url::Url;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RpcSettings {
    pub endpoints: Vec<String>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub max_concurrent: usize,
    pub min_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    result: Option<Value>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    timestamp: U256,
}

pub struct RpcPool {
    client: reqwest::Client,
    endpoints: Vec<Url>,
    cursor: AtomicUsize,
    next_id: AtomicU64,
    permits: Semaphore,
    next_slot: Mutex<Instant>,
    settings: RpcSettings,
}

impl RpcPool {
    pub fn new(settings: RpcSettings) -> Result<Self> {
        if settings.endpoints.is_empty() {
            return Err(PipelineError::Config("no RPC endpoints configured".into()));
        }
        let endpoints = settings
            .endpoints
            .iter()
            .map(|e| {
                Url::parse(e)
                    .map_err(|err| PipelineError::Config(format!("invalid RPC url {}: {}", e, err)))
            })
            .collect::<Result<Vec<_>>>()?;
        let client = reqwest::Client::builder().timeout(settings.timeout).build()?;
        Ok(Self {
            client,
            endpoints,
            cursor: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            permits: Semaphore::new(settings.max_concurrent.max(1)),
            next_slot: Mutex::new(Instant::now()),
            settings,
        })
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    fn current_endpoint(&self) -> (usize, &Url) {
        let idx = self.cursor.load(Ordering::SeqCst) % self.endpoints.len();
        (idx, &self.endpoints[idx])
    }

    /// Move off `failed` unless another caller already rotated.
    fn rotate(&self, failed: usize) {
        let next = (failed + 1) % self.endpoints.len();
        let _ = self
            .cursor
            .compare_exchange(failed, next, Ordering::SeqCst, Ordering::SeqCst);
    }

    async fn pace(&self) {
        let wait = {
            let mut slot = self.next_slot.lock().await;
            let now = Instant::now();
            let start = (*slot).max(now);
            *slot = start + self.settings.min_interval;
            start - now
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    async fn send(&self, endpoint: &Url, method: &str, params: &Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let res = self.client.post(endpoint.clone()).json(&body).send().await?;
        let status = res.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(PipelineError::Transient {
                endpoint: endpoint.to_string(),
                message: format!("HTTP {}", status),
            });
        }
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(PipelineError::Rpc {
                code: i64::from(status.as_u16()),
                message: text,
            });
        }
        let envelope: RpcEnvelope = res.json().await?;
        if let Some(err) = envelope.error {
            return Err(classify_rpc_error(endpoint.as_str(), err.code, &err.message));
        }
        Ok(envelope.result.unwrap_or(Value::Null))
    }

    /// Issue a request, retrying transient failures across endpoints.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let mut last_error = String::new();
        for attempt in 0..=self.settings.max_retries {
            let permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| PipelineError::Config("rpc pool closed".into()))?;
            self.pace().await;
            let (idx, endpoint) = self.current_endpoint();
            debug!("rpc {} via {} (attempt {})", method, endpoint, attempt + 1);
            let res = self.send(endpoint, method, &params).await;
            drop(permit);
            match res {
                Ok(v) => return Ok(serde_json::from_value(v)?),
                Err(e) if e.is_transient() => {
                    warn!("rpc {} failed on {} (attempt {}): {}", method, endpoint, attempt + 1, e);
                    last_error = e.to_string();
                    self.rotate(idx);
                    if attempt < self.settings.max_retries {
                        let delay = backoff_delay(self.settings.backoff_base, attempt);
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(PipelineError::RetriesExhausted {
            attempts: self.settings.max_retries + 1,
            last_error,
        })
    }

    pub async fn block_number(&self) -> Result<u64> {
        let n: U64 = self.call("eth_blockNumber", json!([])).await?;
        Ok(n.as_u64())
    }

    pub async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>> {
        self.call("eth_getLogs", json!([filter])).await
    }

    pub async fn block_timestamp(&self, block: u64) -> Result<i64> {
        let header: Option<BlockHeader> = self
            .call("eth_getBlockByNumber", json!([format!("0x{:x}", block), false]))
            .await?;
        let header = header.ok_or_else(|| PipelineError::Rpc {
            code: 0,
            message: format!("block {} not found", block),
        })?;
        i64::try_from(header.timestamp.low_u64())
            .map_err(|_| {
                PipelineError::DataQuality(format!("block {} timestamp out of range", block))
            })
    }
}

/// `base * 2^attempt`, capped.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.min(16);
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

fn classify_rpc_error(endpoint: &str, code: i64, message: &str) -> PipelineError {
    let lower = message.to_lowercase();
    let throttled = code == 429
        || lower.contains("rate limit")
        || lower.contains("too many requests")
        || lower.contains("timeout");
    if throttled {
        return PipelineError::Transient {
            endpoint: endpoint.to_string(),
            message: format!("{}: {}", code, message),
        };
    }
    if lower.contains("header not found") || lower.contains("unknown block") {
        // Lagging node behind the head we planned against.
        return PipelineError::Transient {
            endpoint: endpoint.to_string(),
            message: format!("{}: {}", code, message),
        };
    }
    let too_large = (lower.contains("more than") && lower.contains("result"))
        || (lower.contains("range")
            && (lower.contains("too large")
                || lower.contains("too wide")
                || lower.contains("exceed")))
        || code == -32005;
    if too_large {
        return PipelineError::RangeTooLarge(message.to_string());
    }
    PipelineError::Rpc {
        code,
        message: message.to_string(),
    }
}
