//! Bulk sends
//!
//! A bulk send is split into fixed-size batches. Batches are submitted to the
//! worker pool one after another with a short pause between submissions, every
//! recipient in a batch is dispatched independently, and the aggregate resolves
//! once every batch has finished or timed out. Individual failures end up in
//! the [`BulkReport`]; they never fail the aggregate.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures_util::{FutureExt, future::join_all};
use herald_common::internal;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    dispatcher::{Dispatcher, SendRequest, SendResult},
    error::DispatchError,
    interrupt::Interrupt,
    pool::{Task, WorkerPool},
    render::Variables,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Recipients per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pause between batch submissions, in milliseconds
    #[serde(default = "default_inter_batch_delay_ms")]
    pub inter_batch_delay_ms: u64,

    /// Time a batch may take before its unfinished sends are reported failed, in seconds
    #[serde(default = "default_batch_timeout_secs")]
    pub batch_timeout_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            inter_batch_delay_ms: default_inter_batch_delay_ms(),
            batch_timeout_secs: default_batch_timeout_secs(),
        }
    }
}

const fn default_batch_size() -> usize {
    50
}

const fn default_inter_batch_delay_ms() -> u64 {
    100
}

const fn default_batch_timeout_secs() -> u64 {
    300
}

/// Trimmed, non-empty recipients in first-seen order, without duplicates
pub fn unique_recipients<S: AsRef<str>>(recipients: &[S]) -> Vec<String> {
    let mut seen = ahash::AHashSet::with_capacity(recipients.len());

    recipients
        .iter()
        .map(|recipient| recipient.as_ref().trim())
        .filter(|recipient| !recipient.is_empty())
        .filter(|recipient| seen.insert(*recipient))
        .map(str::to_string)
        .collect()
}

/// Aggregate outcome of a bulk send
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkReport {
    /// Unique recipients accepted for dispatch
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub batches: usize,
    /// One result per failed recipient
    pub failures: Vec<SendResult>,
}

impl BulkReport {
    fn record(&mut self, result: SendResult) {
        if result.success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
            self.failures.push(result);
        }
    }

    fn fail_all(&mut self, recipients: impl IntoIterator<Item = String>, error: &DispatchError) {
        for recipient in recipients {
            self.record(SendResult::failed(recipient, error, 0));
        }
    }

    /// Whether every recipient was sent to
    #[must_use]
    pub const fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.succeeded == self.submitted
    }
}

/// Fans bulk sends out over the [`Dispatcher`]
#[derive(Debug, Clone)]
pub struct BatchCoordinator {
    dispatcher: Dispatcher,
    pool: WorkerPool,
    config: BatchConfig,
    interrupt: Interrupt,
}

impl BatchCoordinator {
    #[must_use]
    pub fn new(dispatcher: Dispatcher, config: BatchConfig) -> Self {
        Self {
            pool: dispatcher.pool().clone(),
            interrupt: dispatcher.interrupt().clone(),
            dispatcher,
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Bulk send with the configured batch size
    ///
    /// # Errors
    ///
    /// See [`BatchCoordinator::send_bulk_in_batches`].
    pub fn send_bulk<S: AsRef<str>>(
        &self,
        recipients: &[S],
        subject: &str,
        template: &str,
        variables: &Variables,
    ) -> Result<BulkHandle, DispatchError> {
        self.send_bulk_in_batches(recipients, subject, template, variables, self.config.batch_size)
    }

    /// Bulk send with an explicit batch size
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Validation`] if no usable recipient remains
    /// after trimming and de-duplication, or if `batch_size` is zero.
    pub fn send_bulk_in_batches<S: AsRef<str>>(
        &self,
        recipients: &[S],
        subject: &str,
        template: &str,
        variables: &Variables,
        batch_size: usize,
    ) -> Result<BulkHandle, DispatchError> {
        if batch_size == 0 {
            return Err(DispatchError::Validation(
                "batch size must be at least 1".to_string(),
            ));
        }

        let recipients = unique_recipients(recipients);
        if recipients.is_empty() {
            return Err(DispatchError::Validation(
                "no valid recipients".to_string(),
            ));
        }

        let batches: Vec<Vec<String>> = recipients
            .chunks(batch_size)
            .map(<[String]>::to_vec)
            .collect();

        internal!(
            level = INFO,
            "Dispatching {} recipients in {} batches of up to {batch_size}",
            recipients.len(),
            batches.len()
        );

        let prototype = SendRequest::new("", subject, template).with_variables(variables.clone());
        let run = BulkRun {
            dispatcher: self.dispatcher.clone(),
            pool: self.pool.clone(),
            interrupt: self.interrupt.clone(),
            inter_batch_delay: Duration::from_millis(self.config.inter_batch_delay_ms),
            batch_timeout: Duration::from_secs(self.config.batch_timeout_secs),
            prototype,
        };

        Ok(BulkHandle {
            task: self.pool.submit(run.drive(batches)),
            recipients,
        })
    }
}

/// Everything one bulk send needs, owned so it can move onto the pool
struct BulkRun {
    dispatcher: Dispatcher,
    pool: WorkerPool,
    interrupt: Interrupt,
    inter_batch_delay: Duration,
    batch_timeout: Duration,
    prototype: SendRequest,
}

impl BulkRun {
    async fn drive(self, batches: Vec<Vec<String>>) -> BulkReport {
        let mut report = BulkReport {
            submitted: batches.iter().map(Vec::len).sum(),
            batches: batches.len(),
            ..BulkReport::default()
        };

        let mut submitted = Vec::with_capacity(batches.len());
        let mut batches = batches.into_iter();

        while let Some(batch) = batches.next() {
            if !submitted.is_empty() && self.interrupt.sleep(self.inter_batch_delay).await.is_err() {
                let skipped = std::iter::once(batch).chain(batches.by_ref()).flatten();
                report.fail_all(
                    skipped,
                    &DispatchError::Interrupted("shutdown before batch was dispatched".to_string()),
                );
                break;
            }

            let task = self.pool.submit(run_batch(
                self.dispatcher.clone(),
                self.prototype.clone(),
                batch.clone(),
                self.batch_timeout,
            ));
            submitted.push((batch, task));
        }

        for (batch, task) in submitted {
            match task.await {
                Ok(results) => results.into_iter().for_each(|result| report.record(result)),
                Err(error) => report.fail_all(
                    batch,
                    &DispatchError::Interrupted(format!("batch task lost: {error}")),
                ),
            }
        }

        internal!(
            level = INFO,
            "Bulk send finished: {} succeeded, {} failed of {}",
            report.succeeded,
            report.failed,
            report.submitted
        );

        report
    }
}

async fn run_batch(
    dispatcher: Dispatcher,
    prototype: SendRequest,
    batch: Vec<String>,
    timeout: Duration,
) -> Vec<SendResult> {
    let deadline = Instant::now() + timeout;

    let sends = batch.into_iter().map(|recipient| {
        let mut handle = dispatcher.send(SendRequest {
            recipient: recipient.clone(),
            ..prototype.clone()
        });

        async move {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(result) => result,
                Err(_) => {
                    // The send may be mid-transport; let it finish unobserved.
                    handle.detach();
                    let error = DispatchError::Interrupted(format!(
                        "batch timed out after {}s",
                        timeout.as_secs()
                    ));
                    SendResult::failed(recipient, &error, 0)
                }
            }
        }
    });

    join_all(sends).await
}

/// Resolves to the [`BulkReport`] of a bulk send
#[derive(Debug)]
pub struct BulkHandle {
    task: Task<BulkReport>,
    recipients: Vec<String>,
}

impl BulkHandle {
    /// The de-duplicated recipients being sent to
    #[must_use]
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }
}

impl Future for BulkHandle {
    type Output = BulkReport;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.task.poll_unpin(cx).map(|joined| {
            joined.unwrap_or_else(|error| {
                let mut report = BulkReport {
                    submitted: this.recipients.len(),
                    ..BulkReport::default()
                };
                report.fail_all(
                    this.recipients.iter().cloned(),
                    &DispatchError::Interrupted(format!("bulk send lost: {error}")),
                );
                report
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_unique_recipients() {
        let recipients = unique_recipients(&["a@x.com", "a@x.com", " ", "b@y.com"]);
        assert_eq!(recipients, vec!["a@x.com", "b@y.com"]);
    }

    #[test]
    fn test_unique_recipients_trims_before_comparing() {
        let recipients = unique_recipients(&[" c@z.com", "c@z.com ", "", "d@z.com"]);
        assert_eq!(recipients, vec!["c@z.com", "d@z.com"]);
    }

    #[test]
    fn test_report_accounting() {
        let mut report = BulkReport {
            submitted: 3,
            ..BulkReport::default()
        };

        report.record(SendResult::sent("a@x.com", 1));
        report.fail_all(
            ["b@x.com".to_string(), "c@x.com".to_string()],
            &DispatchError::Interrupted("batch timed out after 300s".to_string()),
        );

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(report.failures[1].recipient, "c@x.com");
        assert!(!report.all_succeeded());
    }

    #[test]
    fn test_defaults() {
        let config = BatchConfig::default();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.inter_batch_delay_ms, 100);
        assert_eq!(config.batch_timeout_secs, 300);
    }
}
