use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::backoff::RetryPolicy;
use super::conflict::{
    ConflictPolicy, ConflictResolver, ResolvedAction, SkipReason, SyncDirection,
};
use super::differ::{classify, folder_collisions};
use super::executor::{Executor, LocalDeleteMode, PlannedAction};
use super::local::{LocalScanner, ScanError};
use super::paths::IgnoreRules;
use super::remote_scan::{RemoteScanError, RemoteScanner};
use super::state::{StateError, StateStore};
use super::summary::PassSummary;
use crate::remote::RemoteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassPhase {
    Idle,
    Scanning,
    Classifying,
    Resolving,
    Executing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    FullySynced,
    CompletedWithFailures(usize),
    Aborted(String),
}

#[derive(Debug, Error)]
pub enum PassError {
    #[error("local scan failed: {0}")]
    LocalScan(#[from] ScanError),
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(#[source] RemoteScanError),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("state store: {0}")]
    State(#[from] StateError),
    #[error("interrupted before any action was dispatched")]
    Interrupted,
}

impl From<RemoteScanError> for PassError {
    fn from(err: RemoteScanError) -> Self {
        if err.is_auth_failure() {
            PassError::Authentication(err.to_string())
        } else {
            PassError::RemoteUnavailable(err)
        }
    }
}

/// Engine-facing settings for one pass.
#[derive(Debug, Clone)]
pub struct PassOptions {
    pub local_root: PathBuf,
    pub policy: ConflictPolicy,
    pub direction: SyncDirection,
    pub dry_run: bool,
    pub workers: usize,
    pub retry: RetryPolicy,
    pub local_delete: LocalDeleteMode,
    pub ignore: IgnoreRules,
}

#[derive(Debug)]
pub struct PassReport {
    pub phase: PassPhase,
    pub outcome: PassOutcome,
    pub summary: PassSummary,
    /// Every action that was (or, in a dry run, would be) executed.
    pub plan: Vec<PlannedAction>,
    pub dry_run: bool,
}

impl PassReport {
    fn aborted(reason: String, dry_run: bool) -> Self {
        Self {
            phase: PassPhase::Failed,
            outcome: PassOutcome::Aborted(reason),
            summary: PassSummary::default(),
            plan: Vec::new(),
            dry_run,
        }
    }

    /// 0 fully synced (or dry run), 1 failures or pending manual conflicts, 2 aborted.
    pub fn exit_code(&self) -> i32 {
        match &self.outcome {
            PassOutcome::Aborted(_) => 2,
            _ if self.dry_run => 0,
            PassOutcome::CompletedWithFailures(_) => 1,
            PassOutcome::FullySynced if !self.summary.is_clean() => 1,
            PassOutcome::FullySynced => 0,
        }
    }
}

/// Runs scan, classify, resolve, execute for one local/remote pair.
pub struct Orchestrator {
    options: PassOptions,
    remote: Arc<dyn RemoteStore>,
    state: Arc<StateStore>,
    remote_root_id: String,
    phase: PassPhase,
}

impl Orchestrator {
    pub fn new(
        options: PassOptions,
        remote: Arc<dyn RemoteStore>,
        state: Arc<StateStore>,
        remote_root_id: impl Into<String>,
    ) -> Self {
        Self {
            options,
            remote,
            state,
            remote_root_id: remote_root_id.into(),
            phase: PassPhase::Idle,
        }
    }

    pub fn phase(&self) -> PassPhase {
        self.phase
    }

    /// Never fails: scan-level errors become an `Aborted` report.
    pub async fn run_pass(&mut self, cancel: &CancellationToken) -> PassReport {
        self.transition(PassPhase::Idle);
        match self.try_run(cancel).await {
            Ok(report) => report,
            Err(err) => {
                tracing::error!(error = %err, "sync pass aborted");
                self.transition(PassPhase::Failed);
                PassReport::aborted(err.to_string(), self.options.dry_run)
            }
        }
    }

    async fn try_run(&mut self, cancel: &CancellationToken) -> Result<PassReport, PassError> {
        self.transition(PassPhase::Scanning);
        let baseline = self.state.load_or_reset().await?;
        let local_scanner =
            LocalScanner::new(self.options.local_root.clone(), self.options.ignore.clone());
        let remote_scanner = RemoteScanner::new(
            self.remote.clone(),
            self.options.ignore.clone(),
            self.options.retry,
        );
        let (local, remote) = tokio::join!(
            local_scanner.scan(),
            remote_scanner.scan(&self.remote_root_id)
        );
        let local = local?;
        let remote = remote?;
        if cancel.is_cancelled() {
            return Err(PassError::Interrupted);
        }

        self.transition(PassPhase::Classifying);
        let classifications = classify(&baseline, &local, &remote);

        self.transition(PassPhase::Resolving);
        let occupied = baseline
            .paths()
            .chain(local.files.keys())
            .chain(remote.files.keys())
            .chain(remote.folders.keys())
            .cloned();
        let mut resolver = ConflictResolver::new(self.options.policy, occupied)
            .with_direction(self.options.direction);
        let mut summary = PassSummary {
            skipped: local
                .skipped
                .iter()
                .chain(remote.skipped.iter())
                .cloned()
                .chain(folder_collisions(&local, &remote))
                .collect(),
            ..PassSummary::default()
        };
        let mut plan = Vec::new();
        for (path, classification) in classifications {
            let local_record = local.files.get(&path);
            let remote_record = remote.files.get(&path);
            let base = baseline.get(&path);
            let action = resolver.resolve(
                &path,
                classification,
                local_record,
                remote_record,
                base,
            );
            if action.is_noop() {
                summary.unchanged += 1;
                continue;
            }
            if let ResolvedAction::Skip(_, SkipReason::OtherDirection) = action {
                tracing::debug!(path = %path, %classification, "held back by sync direction");
                summary.held_back.push(path);
                continue;
            }
            tracing::debug!(path = %path, %classification, action = %action, "planned");
            plan.push(PlannedAction {
                action,
                classification,
                local: local_record.cloned(),
                remote: remote_record.cloned(),
                baseline: base.cloned(),
            });
        }

        if self.options.dry_run {
            for planned in &plan {
                if let ResolvedAction::Skip(path, SkipReason::RequiresManualResolution) = &planned.action {
                    summary.manual.push(path.clone());
                }
            }
            self.transition(PassPhase::Completed);
            return Ok(PassReport {
                phase: PassPhase::Completed,
                outcome: PassOutcome::FullySynced,
                summary,
                plan,
                dry_run: true,
            });
        }

        self.transition(PassPhase::Executing);
        let executor = Arc::new(Executor::new(
            self.remote.clone(),
            self.state.clone(),
            self.options.local_root.clone(),
            remote.folders.clone(),
            self.options.retry,
            self.options.local_delete,
        ));
        let auth_failure = self
            .execute_plan(executor, &plan, cancel, &mut summary)
            .await;
        summary.sort();

        if let Some(reason) = auth_failure {
            self.transition(PassPhase::Failed);
            return Ok(PassReport {
                phase: PassPhase::Failed,
                outcome: PassOutcome::Aborted(format!("authentication failed: {reason}")),
                summary,
                plan,
                dry_run: false,
            });
        }
        if cancel.is_cancelled() && !summary.not_dispatched.is_empty() {
            self.transition(PassPhase::Failed);
            return Ok(PassReport {
                phase: PassPhase::Failed,
                outcome: PassOutcome::Aborted("interrupted".to_string()),
                summary,
                plan,
                dry_run: false,
            });
        }

        self.transition(PassPhase::Completed);
        let outcome = if summary.failed.is_empty() {
            PassOutcome::FullySynced
        } else {
            PassOutcome::CompletedWithFailures(summary.failed.len())
        };
        tracing::info!(
            changes = summary.changes(),
            failed = summary.failed.len(),
            manual = summary.manual.len(),
            "sync pass completed"
        );
        Ok(PassReport {
            phase: PassPhase::Completed,
            outcome,
            summary,
            plan,
            dry_run: false,
        })
    }

    /// Dispatches actions onto a bounded pool. Stops dispatching on
    /// cancellation or the first authentication failure; in-flight actions
    /// always run to completion. Returns the authentication error, if any.
    async fn execute_plan(
        &self,
        executor: Arc<Executor>,
        plan: &[PlannedAction],
        cancel: &CancellationToken,
        summary: &mut PassSummary,
    ) -> Option<String> {
        let limit = Arc::new(Semaphore::new(self.options.workers.max(1)));
        let dispatch = cancel.child_token();
        let mut tasks = JoinSet::new();
        let mut pending = HashSet::new();

        for planned in plan {
            let path = planned.action.path().to_string();
            let permit = tokio::select! {
                biased;
                _ = dispatch.cancelled() => None,
                permit = limit.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                summary.not_dispatched.push(path);
                continue;
            };

            let executor = executor.clone();
            let planned = planned.clone();
            let dispatch = dispatch.clone();
            pending.insert(path.clone());
            tasks.spawn(async move {
                let _permit = permit;
                let result = executor.execute(&planned).await;
                if matches!(&result, Err(err) if err.is_auth_failure()) {
                    dispatch.cancel();
                }
                (path, result)
            });
        }

        let mut auth_failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((path, Ok(outcome))) => {
                    pending.remove(&path);
                    summary.record(outcome);
                }
                Ok((path, Err(err))) => {
                    pending.remove(&path);
                    tracing::error!(path = %path, error = %err, "action failed");
                    if err.is_auth_failure() && auth_failure.is_none() {
                        auth_failure = Some(err.to_string());
                    }
                    summary.record_failure(path, &err);
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "worker task failed");
                }
            }
        }
        // Whatever is still pending belongs to a worker that panicked.
        for path in pending {
            summary.record_failure(path, "worker task panicked");
        }
        auth_failure
    }

    fn transition(&mut self, phase: PassPhase) {
        if self.phase != phase {
            tracing::debug!(from = ?self.phase, to = ?phase, "pass phase");
        }
        self.phase = phase;
    }
}
