//! Per-stage worker loops for source, transform, and sink stages.
//!
//! One worker runs per stage. Source workers generate batches, transform
//! workers map them, sink workers persist them. Every blocking point — queue
//! push/pop and retry backoff sleeps — races the run's cancellation token,
//! so cancellation takes effect within one blocking-call granularity.

use std::time::Instant;

use flowline_types::{Batch, Record, RetryPolicy, StageError};
use tokio_util::sync::CancellationToken;

use crate::error::compute_backoff;
use crate::queue::{BatchReceiver, BatchSender, Pop};
use crate::stage::{Sink, Source, StageOutcome, StageResult, StageRole, Transform};

/// Sleep out the backoff before the given retry attempt.
///
/// Returns `false` if the run was cancelled during the wait.
async fn retry_backoff(
    stage: &str,
    policy: &RetryPolicy,
    err: &StageError,
    attempt: u32,
    cancel: &CancellationToken,
) -> bool {
    let delay = compute_backoff(policy, err, attempt);
    #[allow(clippy::cast_possible_truncation)]
    let delay_ms = delay.as_millis() as u64;
    tracing::warn!(
        stage,
        attempt,
        max_retries = policy.max_retries,
        delay_ms,
        category = %err.category,
        code = %err.code,
        "Retryable stage error, backing off"
    );
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

fn finish(stage: String, role: StageRole, result: StageResult, started: Instant) -> StageOutcome {
    let duration_secs = started.elapsed().as_secs_f64();
    match &result {
        StageResult::Completed(records) => {
            tracing::info!(stage = %stage, role = %role, records, "Stage completed");
        }
        StageResult::Failed(error, records) => {
            tracing::error!(stage = %stage, role = %role, records, error = %error, "Stage failed");
        }
        StageResult::Cancelled(records) => {
            tracing::debug!(stage = %stage, role = %role, records, "Stage cancelled");
        }
    }
    StageOutcome {
        stage,
        role,
        result,
        duration_secs,
    }
}

/// Run a source stage: fetch payloads, batch them up, push downstream, then
/// send end-of-stream and report the record count.
pub(crate) async fn run_source_stage<T, S>(
    stage: String,
    mut source: S,
    output: BatchSender<T>,
    batch_size: usize,
    policy: RetryPolicy,
    cancel: CancellationToken,
) -> StageOutcome
where
    T: Send,
    S: Source<T>,
{
    let started = Instant::now();
    tracing::debug!(stage = %stage, batch_size, "Starting source stage");
    let result = source_loop(&stage, &mut source, &output, batch_size, &policy, &cancel).await;
    finish(stage, StageRole::Source, result, started)
}

async fn source_loop<T, S>(
    stage: &str,
    source: &mut S,
    output: &BatchSender<T>,
    batch_size: usize,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> StageResult
where
    T: Send,
    S: Source<T>,
{
    let mut next_sequence_id = 0u64;
    let mut records_out = 0u64;
    let mut pending: Vec<Record<T>> = Vec::with_capacity(batch_size);

    loop {
        if cancel.is_cancelled() {
            return StageResult::Cancelled(records_out);
        }

        let mut attempt = 0u32;
        let item = loop {
            match source.fetch_next().await {
                Ok(item) => break item,
                Err(err) if err.retryable && attempt < policy.max_retries => {
                    attempt += 1;
                    if !retry_backoff(stage, policy, &err, attempt, cancel).await {
                        return StageResult::Cancelled(records_out);
                    }
                }
                Err(err) => return StageResult::Failed(err, records_out),
            }
        };

        let Some(payload) = item else { break };

        let key = source.key(&payload);
        let mut record = Record::new(next_sequence_id, payload);
        if let Some(key) = key {
            record = record.with_key(key);
        }
        next_sequence_id += 1;
        pending.push(record);

        if pending.len() >= batch_size {
            let batch = Batch::new(std::mem::replace(
                &mut pending,
                Vec::with_capacity(batch_size),
            ));
            let count = batch.len() as u64;
            if output.push(batch).await.is_err() {
                return StageResult::Cancelled(records_out);
            }
            records_out += count;
        }
    }

    if !pending.is_empty() {
        let batch = Batch::new(std::mem::take(&mut pending));
        let count = batch.len() as u64;
        if output.push(batch).await.is_err() {
            return StageResult::Cancelled(records_out);
        }
        records_out += count;
    }

    if output.push_end().await.is_err() {
        return StageResult::Cancelled(records_out);
    }
    StageResult::Completed(records_out)
}

/// Run a transform stage: pop, process, push, forward end-of-stream on clean
/// completion. A failed transform never forwards the marker.
pub(crate) async fn run_transform_stage<In, Out, F>(
    stage: String,
    mut transform: F,
    mut input: BatchReceiver<In>,
    output: BatchSender<Out>,
    policy: RetryPolicy,
    cancel: CancellationToken,
) -> StageOutcome
where
    In: Send,
    Out: Send,
    F: Transform<In, Out>,
{
    let started = Instant::now();
    tracing::debug!(stage = %stage, "Starting transform stage");
    let result = transform_loop(&stage, &mut transform, &mut input, &output, &policy, &cancel).await;
    finish(stage, StageRole::Transform, result, started)
}

async fn transform_loop<In, Out, F>(
    stage: &str,
    transform: &mut F,
    input: &mut BatchReceiver<In>,
    output: &BatchSender<Out>,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> StageResult
where
    In: Send,
    Out: Send,
    F: Transform<In, Out>,
{
    let mut records_in = 0u64;

    loop {
        match input.pop().await {
            Pop::Batch(batch) => {
                let mut attempt = 0u32;
                let out = loop {
                    match transform.process(&batch).await {
                        Ok(out) => break out,
                        Err(err) if err.retryable && attempt < policy.max_retries => {
                            attempt += 1;
                            if !retry_backoff(stage, policy, &err, attempt, cancel).await {
                                return StageResult::Cancelled(records_in);
                            }
                        }
                        Err(err) => return StageResult::Failed(err, records_in),
                    }
                };
                records_in += batch.len() as u64;
                // Empty output batches are dropped, never forwarded.
                if !out.is_empty() && output.push(out).await.is_err() {
                    return StageResult::Cancelled(records_in);
                }
            }
            Pop::EndOfStream => {
                if output.push_end().await.is_err() {
                    return StageResult::Cancelled(records_in);
                }
                return StageResult::Completed(records_in);
            }
            Pop::Cancelled => return StageResult::Cancelled(records_in),
        }
    }
}

/// Run a sink stage: pop and persist until end-of-stream, reporting records
/// durably written.
pub(crate) async fn run_sink_stage<T, K>(
    stage: String,
    mut sink: K,
    mut input: BatchReceiver<T>,
    policy: RetryPolicy,
    cancel: CancellationToken,
) -> StageOutcome
where
    T: Send,
    K: Sink<T>,
{
    let started = Instant::now();
    tracing::debug!(stage = %stage, "Starting sink stage");
    let result = sink_loop(&stage, &mut sink, &mut input, &policy, &cancel).await;
    finish(stage, StageRole::Sink, result, started)
}

async fn sink_loop<T, K>(
    stage: &str,
    sink: &mut K,
    input: &mut BatchReceiver<T>,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> StageResult
where
    T: Send,
    K: Sink<T>,
{
    let mut records_written = 0u64;

    loop {
        match input.pop().await {
            Pop::Batch(batch) => {
                let mut attempt = 0u32;
                let written = loop {
                    match sink.write(&batch).await {
                        Ok(n) => break n,
                        Err(err) if err.retryable && attempt < policy.max_retries => {
                            attempt += 1;
                            if !retry_backoff(stage, policy, &err, attempt, cancel).await {
                                return StageResult::Cancelled(records_written);
                            }
                        }
                        Err(err) => return StageResult::Failed(err, records_written),
                    }
                };
                records_written += written;
            }
            Pop::EndOfStream => return StageResult::Completed(records_written),
            Pop::Cancelled => return StageResult::Cancelled(records_written),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct VecSource {
        items: VecDeque<i64>,
        fail_after: Option<usize>,
        error: Option<StageError>,
        fetched: usize,
    }

    impl VecSource {
        fn new(items: Vec<i64>) -> Self {
            Self {
                items: items.into(),
                fail_after: None,
                error: None,
                fetched: 0,
            }
        }
    }

    #[async_trait]
    impl Source<i64> for VecSource {
        async fn fetch_next(&mut self) -> Result<Option<i64>, StageError> {
            if let (Some(n), Some(err)) = (self.fail_after, self.error.clone()) {
                if self.fetched >= n {
                    return Err(err);
                }
            }
            self.fetched += 1;
            Ok(self.items.pop_front())
        }
    }

    struct Doubler;

    #[async_trait]
    impl Transform<i64, i64> for Doubler {
        async fn process(&mut self, batch: &Batch<i64>) -> Result<Batch<i64>, StageError> {
            Ok(batch.clone().map(|v| v * 2))
        }
    }

    /// Fails transiently `failures` times, then succeeds forever.
    struct FlakyDoubler {
        failures: u32,
    }

    #[async_trait]
    impl Transform<i64, i64> for FlakyDoubler {
        async fn process(&mut self, batch: &Batch<i64>) -> Result<Batch<i64>, StageError> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(StageError::transient_io("FLAKY", "transient glitch"));
            }
            Ok(batch.clone().map(|v| v * 2))
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_ms: 1,
        }
    }

    async fn drain_payloads(rx: &mut BatchReceiver<i64>) -> (Vec<i64>, bool) {
        let mut payloads = Vec::new();
        loop {
            match rx.pop().await {
                Pop::Batch(b) => payloads.extend(b.iter().map(|r| *r.payload())),
                Pop::EndOfStream => return (payloads, true),
                Pop::Cancelled => return (payloads, false),
            }
        }
    }

    #[tokio::test]
    async fn source_batches_and_assigns_sequence_ids() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = queue::bounded(8, cancel.clone());
        let worker = tokio::spawn(run_source_stage(
            "numbers".to_string(),
            VecSource::new((0..10).collect()),
            tx,
            3,
            fast_policy(0),
            cancel,
        ));

        let mut seqs = Vec::new();
        let mut sizes = Vec::new();
        loop {
            match rx.pop().await {
                Pop::Batch(b) => {
                    sizes.push(b.len());
                    seqs.extend(b.iter().map(|r| r.sequence_id()));
                }
                Pop::EndOfStream => break,
                Pop::Cancelled => panic!("unexpected cancel"),
            }
        }

        // 10 records at batch size 3: three full batches plus the tail.
        assert_eq!(sizes, vec![3, 3, 3, 1]);
        assert_eq!(seqs, (0..10).collect::<Vec<u64>>());

        let outcome = worker.await.unwrap();
        assert_eq!(outcome.result, StageResult::Completed(10));
    }

    #[tokio::test]
    async fn failed_source_does_not_forward_end_of_stream() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = queue::bounded(8, cancel.clone());
        let source = VecSource {
            items: (0..100).collect(),
            fail_after: Some(4),
            error: Some(StageError::data("BAD", "corrupt row")),
            fetched: 0,
        };
        let worker = tokio::spawn(run_source_stage(
            "numbers".to_string(),
            source,
            tx,
            2,
            fast_policy(0),
            cancel,
        ));

        let outcome = worker.await.unwrap();
        assert!(matches!(outcome.result, StageResult::Failed(_, 4)));

        // Downstream must not observe a clean finish.
        let (_, clean) = drain_payloads(&mut rx).await;
        assert!(!clean);
    }

    #[tokio::test]
    async fn transform_doubles_and_forwards_marker() {
        let cancel = CancellationToken::new();
        let (up_tx, up_rx) = queue::bounded(4, cancel.clone());
        let (down_tx, mut down_rx) = queue::bounded(4, cancel.clone());
        let worker = tokio::spawn(run_transform_stage(
            "double".to_string(),
            Doubler,
            up_rx,
            down_tx,
            fast_policy(0),
            cancel,
        ));

        let batch = Batch::new((1..=3).map(|v| Record::new(v as u64 - 1, v)).collect());
        up_tx.push(batch).await.unwrap();
        up_tx.push_end().await.unwrap();

        let (payloads, clean) = drain_payloads(&mut down_rx).await;
        assert!(clean);
        assert_eq!(payloads, vec![2, 4, 6]);

        let outcome = worker.await.unwrap();
        assert_eq!(outcome.result, StageResult::Completed(3));
    }

    struct EvensOnly;

    #[async_trait]
    impl Transform<i64, i64> for EvensOnly {
        async fn process(&mut self, batch: &Batch<i64>) -> Result<Batch<i64>, StageError> {
            Ok(batch.clone().filter(|v| v % 2 == 0))
        }
    }

    #[tokio::test]
    async fn fully_filtered_batches_are_not_forwarded() {
        let cancel = CancellationToken::new();
        let (up_tx, up_rx) = queue::bounded(4, cancel.clone());
        let (down_tx, mut down_rx) = queue::bounded(4, cancel.clone());
        let worker = tokio::spawn(run_transform_stage(
            "evens".to_string(),
            EvensOnly,
            up_rx,
            down_tx,
            fast_policy(0),
            cancel,
        ));

        // First batch filters down to nothing; the consumer must only ever
        // see the non-empty output and a clean end-of-stream.
        up_tx
            .push(Batch::new(vec![Record::new(0, 1), Record::new(1, 3)]))
            .await
            .unwrap();
        up_tx
            .push(Batch::new(vec![Record::new(2, 2), Record::new(3, 5)]))
            .await
            .unwrap();
        up_tx.push_end().await.unwrap();

        let (payloads, clean) = drain_payloads(&mut down_rx).await;
        assert!(clean);
        assert_eq!(payloads, vec![2]);
        assert_eq!(worker.await.unwrap().result, StageResult::Completed(4));
    }

    #[tokio::test]
    async fn transform_retries_transient_errors_until_success() {
        let cancel = CancellationToken::new();
        let (up_tx, up_rx) = queue::bounded(4, cancel.clone());
        let (down_tx, mut down_rx) = queue::bounded(4, cancel.clone());
        let worker = tokio::spawn(run_transform_stage(
            "double".to_string(),
            FlakyDoubler { failures: 2 },
            up_rx,
            down_tx,
            fast_policy(3),
            cancel,
        ));

        up_tx
            .push(Batch::new(vec![Record::new(0, 21)]))
            .await
            .unwrap();
        up_tx.push_end().await.unwrap();

        let (payloads, clean) = drain_payloads(&mut down_rx).await;
        assert!(clean);
        assert_eq!(payloads, vec![42]);
        assert_eq!(worker.await.unwrap().result, StageResult::Completed(1));
    }

    #[tokio::test]
    async fn transform_fails_when_retries_exhausted() {
        let cancel = CancellationToken::new();
        let (up_tx, up_rx) = queue::bounded(4, cancel.clone());
        let (down_tx, mut down_rx) = queue::bounded(4, cancel.clone());
        let worker = tokio::spawn(run_transform_stage(
            "double".to_string(),
            FlakyDoubler { failures: 5 },
            up_rx,
            down_tx,
            fast_policy(1),
            cancel,
        ));

        up_tx
            .push(Batch::new(vec![Record::new(0, 21)]))
            .await
            .unwrap();

        let outcome = worker.await.unwrap();
        assert!(matches!(outcome.result, StageResult::Failed(_, 0)));

        let (_, clean) = drain_payloads(&mut down_rx).await;
        assert!(!clean);
    }

    struct CountingSink {
        written: u64,
    }

    #[async_trait]
    impl Sink<i64> for CountingSink {
        async fn write(&mut self, batch: &Batch<i64>) -> Result<u64, StageError> {
            self.written += batch.len() as u64;
            Ok(batch.len() as u64)
        }
    }

    #[tokio::test]
    async fn sink_counts_until_end_of_stream() {
        let cancel = CancellationToken::new();
        let (tx, rx) = queue::bounded(4, cancel.clone());
        let worker = tokio::spawn(run_sink_stage(
            "collect".to_string(),
            CountingSink { written: 0 },
            rx,
            fast_policy(0),
            cancel,
        ));

        for chunk in [vec![1, 2], vec![3], vec![4, 5, 6]] {
            let batch = Batch::new(
                chunk
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| Record::new(i as u64, v))
                    .collect(),
            );
            tx.push(batch).await.unwrap();
        }
        tx.push_end().await.unwrap();

        let outcome = worker.await.unwrap();
        assert_eq!(outcome.result, StageResult::Completed(6));
    }
}
