use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use querycache::{QueryClient, QueryError, QueryFilter, QueryKey, QueryOptions, RefetchType};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// The number of distinct keys requests are spread over.
    pub keys: usize,
    /// How long the simulated backend takes per call.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// The share of backend calls failing with a transient error.
    #[serde(default)]
    pub failure_rate: f64,
    /// Overrides the configured stale time for this workload.
    #[serde(default, with = "humantime_serde")]
    pub stale_time: Option<Duration>,
    /// Invalidates all keys after this many requests.
    #[serde(default)]
    pub invalidate_every: Option<usize>,
}

/// A workload bound to its own client and simulated backend.
pub struct PreparedWorkload {
    pub workload: Workload,
    pub client: QueryClient,
    backend: Arc<SimulatedBackend>,
    requests: AtomicUsize,
}

impl PreparedWorkload {
    pub fn new(workload: Workload, client: QueryClient) -> Self {
        let backend = Arc::new(SimulatedBackend {
            latency: workload.latency,
            failure_rate: workload.failure_rate.clamp(0.0, 1.0),
            calls: AtomicUsize::new(0),
        });
        Self {
            workload,
            client,
            backend,
            requests: AtomicUsize::new(0),
        }
    }

    /// The number of times the backend was called.
    pub fn backend_calls(&self) -> usize {
        self.backend.calls.load(Ordering::Relaxed)
    }

    fn options(&self) -> QueryOptions {
        let mut options = QueryOptions::default();
        options.stale_time = self.workload.stale_time;
        options
    }
}

struct SimulatedBackend {
    latency: Duration,
    failure_rate: f64,
    calls: AtomicUsize,
}

impl SimulatedBackend {
    async fn call(&self, key: QueryKey) -> Result<String, QueryError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let fails = rand::rng().random_bool(self.failure_rate);

        tokio::time::sleep(self.latency).await;
        if fails {
            return Err(QueryError::Server {
                status: 503,
                message: "simulated failure".into(),
            });
        }
        Ok(format!("payload for {key}"))
    }
}

/// Requests one random key of the workload, and invalidates when it is time to.
///
/// Returns whether the request produced data.
pub async fn process_workload(workload: &PreparedWorkload) -> bool {
    let request = workload.requests.fetch_add(1, Ordering::Relaxed) + 1;
    if let Some(every) = workload.workload.invalidate_every {
        if every > 0 && request % every == 0 {
            workload
                .client
                .invalidate_queries(&QueryFilter::all(), RefetchType::None)
                .await;
        }
    }

    let id = rand::rng().random_range(0..workload.workload.keys.max(1));
    let key = QueryKey::from(format!("item-{id}"));
    let backend = Arc::clone(&workload.backend);
    let result = workload
        .client
        .fetch_query(key, workload.options(), move |key| {
            let backend = Arc::clone(&backend);
            async move { backend.call(key).await }
        })
        .await;
    result.is_ok()
}
