use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::future::join_all;
use parking_lot::Mutex;
use querycache::QueryClient;
use querycache::config::Config;
use sentry::{Hub, SentryFutureExt, TransactionContext};
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{PreparedWorkload, WorkloadsConfig, process_workload};

/// What one workload did during the measured run.
struct Outcome {
    concurrency: usize,
    durations: DDSketch,
    failed: usize,
    backend_calls: usize,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // one client, and thus one cache, per workload
    let prepared: Vec<_> = workloads
        .workloads
        .into_iter()
        .map(|workload| {
            let client = QueryClient::from_config(&config);
            Arc::new(PreparedWorkload::new(workload, client))
        })
        .collect();

    let warmup_start = Instant::now();
    join_all(prepared.iter().cloned().map(|workload| {
        tokio::spawn(async move {
            process_workload(&workload).await;
        })
    }))
    .await;
    println!("Warmup: {:?}\n", warmup_start.elapsed());

    let deadline = tokio::time::Instant::now() + duration;
    let runs = prepared
        .into_iter()
        .map(|workload| tokio::spawn(run_until(workload, deadline)));

    for (i, outcome) in join_all(runs).await.into_iter().enumerate() {
        report(i, &outcome?, duration);
    }

    Ok(())
}

/// Keeps `concurrency` requests in flight until `deadline`, then waits for the stragglers.
async fn run_until(workload: Arc<PreparedWorkload>, deadline: tokio::time::Instant) -> Outcome {
    let concurrency = workload.workload.concurrency.max(1);
    let calls_before = workload.backend_calls();
    let durations = Arc::new(Mutex::new(DDSketch::default()));
    let failed = Arc::new(AtomicUsize::new(0));
    let slots = Arc::new(Semaphore::new(concurrency));

    let timeout = tokio::time::sleep_until(deadline);
    tokio::pin!(timeout);

    loop {
        let permit = tokio::select! {
            permit = slots.clone().acquire_owned() => permit,
            _ = &mut timeout => break,
        };

        let workload = Arc::clone(&workload);
        let durations = Arc::clone(&durations);
        let failed = Arc::clone(&failed);

        let hub = Arc::new(Hub::new_from_top(Hub::current()));
        let transaction = hub.start_transaction(TransactionContext::new("stresstest", "request"));
        let request = async move {
            let started = Instant::now();
            if !process_workload(&workload).await {
                failed.fetch_add(1, Ordering::Relaxed);
            }
            transaction.finish();
            durations.lock().add(started.elapsed().as_secs_f64());
            drop(permit);
        };
        tokio::spawn(request.bind_hub(hub));
    }

    // holding every permit means no request is outstanding
    let _all = slots.acquire_many(concurrency as u32).await;

    let durations = std::mem::take(&mut *durations.lock());
    Outcome {
        concurrency,
        durations,
        failed: failed.load(Ordering::Relaxed),
        backend_calls: workload.backend_calls() - calls_before,
    }
}

fn report(index: usize, outcome: &Outcome, duration: Duration) {
    let Outcome {
        concurrency,
        durations,
        failed,
        backend_calls,
    } = outcome;

    let ops = durations.count();
    let ops_per_sec = ops as f32 / duration.as_secs_f32();
    println!("Workload {index} (concurrency: {concurrency}): {ops} requests, {ops_per_sec:.2}/s");
    if ops == 0 {
        return;
    }

    // requests that did not cost a backend call of their own
    let shared = (1.0 - *backend_calls as f64 / ops as f64).max(0.0);
    println!(
        "  failed: {failed}; backend calls: {backend_calls}; served from cache or shared: {:.1}%",
        shared * 100.0
    );

    let at = |q| Duration::from_secs_f64(durations.quantile(q).ok().flatten().unwrap_or_default());
    let avg = Duration::from_secs_f64(durations.sum().unwrap_or_default() / ops as f64);
    println!(
        "  avg: {avg:.2?}; p50: {:.2?}; p90: {:.2?}; p99: {:.2?}",
        at(0.5),
        at(0.9),
        at(0.99)
    );
}
