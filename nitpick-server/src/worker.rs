//! Webhook worker: queue consumers and the event router.
//!
//! Each consumer claims jobs from the shared queue and runs them through
//! [`process_job`]: ledger insert, route by `(event type, action)`, mark
//! processed. A handler error propagates to the queue layer, which retries
//! with backoff; the ledger row stays unprocessed so the retry runs the
//! handler again. Optional side effects (the summary comment) are isolated
//! from that retry path: they run only after the review data is durably
//! saved, and their failures are logged and swallowed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use nitpick_core::event::{
    DeliveryJob, InstallationPayload, PullRequestPayload, RepositoryPayload, WebhookEvent,
    WebhookPayload,
};

use crate::analysis::AnalysisEngine;
use crate::github::Provider;
use crate::queue::{ClaimedJob, FailDisposition, JobQueue};
use crate::registry::InstallationRegistry;
use crate::session::{DraftFinding, SessionStatus, SessionTotals};
use crate::store::{LedgerOutcome, NewDelivery, NewInstallation, RepoUpsert, Store};

pub const WEBHOOK_JOB_KIND: &str = "webhook_delivery";

/// Number of concurrent queue consumers, unless overridden by config.
pub const DEFAULT_WORKER_COUNT: usize = 5;

const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Everything a consumer needs to process jobs.
pub struct WorkerContext {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn JobQueue>,
    pub registry: Arc<InstallationRegistry>,
    pub provider: Arc<dyn Provider>,
    pub engine: Arc<dyn AnalysisEngine>,
}

/// Spawns the consumer pool. Cancelling `shutdown` makes each consumer stop
/// claiming and finish its in-flight job (the drain sequence); await the
/// returned handles to complete it.
pub fn spawn_workers(
    ctx: Arc<WorkerContext>,
    count: usize,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|index| {
            let ctx = ctx.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                consumer_loop(ctx, shutdown, index).await;
            })
        })
        .collect()
}

async fn consumer_loop(ctx: Arc<WorkerContext>, shutdown: CancellationToken, index: usize) {
    let mut poll = interval(CLAIM_POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("worker {index} draining");
                break;
            }
            _ = poll.tick() => {
                drain_available_jobs(&ctx, &shutdown, index).await;
            }
        }
    }
}

/// Claims and processes jobs until the queue is empty or shutdown begins.
async fn drain_available_jobs(ctx: &WorkerContext, shutdown: &CancellationToken, index: usize) {
    loop {
        let job = match ctx.queue.claim().await {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(e) => {
                error!("worker {index}: failed to claim job: {e}");
                break;
            }
        };

        let job_id = job.id;
        match process_job(ctx, &job).await {
            Ok(()) => {
                if let Err(e) = ctx.queue.complete(job_id).await {
                    error!("worker {index}: failed to complete job {job_id}: {e}");
                }
            }
            Err(e) => {
                error!(
                    "worker {index}: job {job_id} failed (attempt {}/{}): {e:#}",
                    job.attempt, job.max_attempts
                );
                match ctx.queue.fail(job_id, &format!("{e:#}")).await {
                    Ok(FailDisposition::Retrying { delay }) => {
                        debug!("job {job_id} rescheduled in {}s", delay.as_secs());
                    }
                    Ok(FailDisposition::Failed) => {
                        warn!("job {job_id} exhausted its attempts and was parked as failed");
                    }
                    Err(e) => error!("worker {index}: failed to record job failure: {e}"),
                }
            }
        }

        if shutdown.is_cancelled() {
            break;
        }
    }
}

/// Processes one claimed job to completion.
///
/// The ledger insert is the effectively-once guard: `AlreadyProcessed` is a
/// successful no-op. `InFlight` (row exists, unprocessed) only occurs on
/// queue retries of a previously failed attempt (the queue collapses
/// same-key submissions, so one delivery is never claimed by two consumers)
/// and must be processed again, not skipped.
pub async fn process_job(ctx: &WorkerContext, job: &ClaimedJob) -> Result<()> {
    if job.kind != WEBHOOK_JOB_KIND {
        warn!("unknown job kind '{}'; ignoring", job.kind);
        return Ok(());
    }

    let delivery: DeliveryJob = serde_json::from_value(job.payload.clone())
        .context("malformed delivery job payload")?;

    // Metadata columns for the audit trail; tolerant of malformed bodies.
    let meta: WebhookPayload = serde_json::from_str(&delivery.payload).unwrap_or_default();

    let outcome = ctx
        .store
        .insert_delivery(NewDelivery {
            delivery_id: &delivery.delivery_id,
            event_type: &delivery.event_type,
            action: meta.action.as_deref(),
            installation_id: meta.installation.as_ref().map(|i| i.id),
            repository_id: meta.repository.as_ref().map(|r| r.id),
            payload: &delivery.payload,
        })
        .await?;

    match outcome {
        LedgerOutcome::AlreadyProcessed => {
            info!(
                "delivery {} already processed; skipping",
                delivery.delivery_id
            );
            return Ok(());
        }
        LedgerOutcome::InFlight => {
            info!(
                "delivery {} has an unprocessed ledger row; reprocessing (queue retry)",
                delivery.delivery_id
            );
        }
        LedgerOutcome::Inserted => {}
    }

    match WebhookEvent::parse(&delivery.event_type, delivery.payload.as_bytes()) {
        Ok(event) => route_event(ctx, event).await?,
        Err(e) => {
            // The payload passed signature verification but cannot be
            // routed. A retry would re-parse identical bytes, so this is
            // non-retryable: record it and move on.
            warn!(
                "delivery {}: unroutable payload ({e}); marking processed",
                delivery.delivery_id
            );
        }
    }

    ctx.store
        .mark_delivery_processed(&delivery.delivery_id)
        .await?;
    Ok(())
}

async fn route_event(ctx: &WorkerContext, event: WebhookEvent) -> Result<()> {
    match event {
        WebhookEvent::InstallationCreated { installation } => {
            handle_installation_created(ctx, installation).await
        }
        WebhookEvent::InstallationDeleted { installation }
        | WebhookEvent::InstallationSuspended { installation } => {
            if !ctx.registry.suspend(installation.id).await? {
                warn!(
                    "suspend event for unknown installation {}; nothing to do",
                    installation.id
                );
            }
            Ok(())
        }
        WebhookEvent::InstallationUnsuspended { installation } => {
            if !ctx.registry.reactivate(installation.id).await? {
                warn!(
                    "unsuspend event for unknown installation {}; nothing to do",
                    installation.id
                );
            }
            Ok(())
        }
        WebhookEvent::RepositoriesAdded { installation } => {
            // Full resync: simpler than incremental adds and idempotent.
            ctx.registry.resync_repositories(installation.id).await?;
            Ok(())
        }
        WebhookEvent::RepositoriesRemoved {
            installation,
            repositories,
        } => {
            let ids: Vec<u64> = repositories.iter().map(|r| r.id).collect();
            let changed = ctx.registry.mark_repositories_inactive(&ids).await?;
            info!(
                "marked {changed} repositories inactive for installation {}",
                installation.id
            );
            Ok(())
        }
        WebhookEvent::PullRequestOpened {
            installation,
            repository,
            pull_request,
        }
        | WebhookEvent::PullRequestSynchronized {
            installation,
            repository,
            pull_request,
        } => handle_pull_request_update(ctx, installation, repository, pull_request).await,
        WebhookEvent::PullRequestClosed {
            repository,
            pull_request,
            ..
        } => handle_pull_request_closed(ctx, repository, pull_request).await,
        WebhookEvent::Push => {
            debug!("push event received; no handler registered");
            Ok(())
        }
        WebhookEvent::Unhandled { event_type, action } => {
            info!("unhandled webhook event {event_type}/{action:?}");
            Ok(())
        }
    }
}

async fn handle_installation_created(
    ctx: &WorkerContext,
    installation: InstallationPayload,
) -> Result<()> {
    let Some(account) = installation.account else {
        warn!(
            "installation.created for {} carries no account; skipping",
            installation.id
        );
        return Ok(());
    };

    ctx.registry
        .upsert_installation(NewInstallation {
            provider_installation_id: installation.id,
            account_id: account.id,
            account_login: account.login,
            account_type: account.account_type,
            user_id: None,
        })
        .await?;

    ctx.registry.resync_repositories(installation.id).await?;
    Ok(())
}

async fn handle_pull_request_update(
    ctx: &WorkerContext,
    installation: InstallationPayload,
    repository: RepositoryPayload,
    pull_request: PullRequestPayload,
) -> Result<()> {
    // A PR delivery can only arrive for an installed app, so a missing
    // installation row means its `installation.created` delivery is still in
    // flight. Erroring here lets the queue's backoff resolve the ordering.
    let installation_row = ctx
        .store
        .get_installation_by_provider_id(installation.id)
        .await?
        .ok_or_else(|| {
            anyhow!(
                "installation {} not registered yet; delivery will be retried",
                installation.id
            )
        })?;

    let repo_row = match ctx
        .store
        .get_repository_by_provider_id(repository.id)
        .await?
    {
        Some(row) => row,
        None => {
            // Repo not yet synced (webhook raced the resync); register it
            // from the payload.
            ctx.store
                .upsert_repositories(
                    installation_row.id,
                    &[RepoUpsert {
                        provider_repo_id: repository.id,
                        name: repository.name.clone(),
                        full_name: repository.full_name.clone(),
                        is_private: repository.private,
                        language: repository.language.clone(),
                        default_branch: repository
                            .default_branch
                            .clone()
                            .unwrap_or_else(|| "main".to_string()),
                    }],
                )
                .await?;
            ctx.store
                .get_repository_by_provider_id(repository.id)
                .await?
                .ok_or_else(|| anyhow!("repository row missing after upsert"))?
        }
    };

    let (repo_owner, repo_name) = repository
        .full_name
        .split_once('/')
        .ok_or_else(|| anyhow!("malformed repository full name '{}'", repository.full_name))?;

    let session = ctx
        .store
        .upsert_session(crate::store::SessionUpsert {
            repository_id: repo_row.id,
            pull_request_number: pull_request.number,
            provider_pr_id: pull_request.id,
            status: SessionStatus::Analyzing,
            title: pull_request.title.clone(),
            author: pull_request.user.as_ref().map(|u| u.login.clone()),
        })
        .await?;

    info!(
        "analyzing {}#{} (session {})",
        repository.full_name, pull_request.number, session.id
    );

    let findings = match ctx
        .engine
        .analyze(installation.id, repo_owner, repo_name, pull_request.number)
        .await
    {
        Ok(findings) => findings,
        Err(e) => {
            // Record the failure on the session, then let the queue retry
            // the job. A retry moves the session back to analyzing.
            error!(
                "analysis failed for {}#{}: {e:#}",
                repository.full_name, pull_request.number
            );
            ctx.store
                .set_session_status(session.id, SessionStatus::Error)
                .await?;
            return Err(e.context("analysis engine failed"));
        }
    };

    ctx.store.replace_findings(session.id, &findings).await?;
    let totals = SessionTotals::from_findings(&findings);
    ctx.store.complete_session(session.id, totals).await?;

    info!(
        "review of {}#{} completed: {} issues ({} critical)",
        repository.full_name, pull_request.number, totals.total_issues, totals.critical_issues
    );

    // Best-effort: the review data is already durably saved, so a comment
    // failure must not fail (and re-run) the job.
    if let Err(e) = post_summary_comment(
        ctx,
        installation.id,
        repo_owner,
        repo_name,
        pull_request.number,
        &findings,
    )
    .await
    {
        warn!(
            "failed to post review summary for {}#{}: {e:#}",
            repository.full_name, pull_request.number
        );
    }

    Ok(())
}

async fn handle_pull_request_closed(
    ctx: &WorkerContext,
    repository: RepositoryPayload,
    pull_request: PullRequestPayload,
) -> Result<()> {
    let Some(repo_row) = ctx
        .store
        .get_repository_by_provider_id(repository.id)
        .await?
    else {
        debug!(
            "close event for unknown repository {}; nothing to do",
            repository.full_name
        );
        return Ok(());
    };

    let Some(session) = ctx
        .store
        .get_session(repo_row.id, pull_request.number)
        .await?
    else {
        debug!(
            "close event for {}#{} with no session; nothing to do",
            repository.full_name, pull_request.number
        );
        return Ok(());
    };

    if session.status.is_terminal() {
        return Ok(());
    }

    let next = if pull_request.merged.unwrap_or(false) {
        SessionStatus::Completed
    } else {
        SessionStatus::Cancelled
    };
    ctx.store.set_session_status(session.id, next).await?;

    info!(
        "session {} for {}#{} closed as {}",
        session.id, repository.full_name, pull_request.number, next
    );
    Ok(())
}

async fn post_summary_comment(
    ctx: &WorkerContext,
    installation_id: u64,
    repo_owner: &str,
    repo_name: &str,
    pr_number: u64,
    findings: &[DraftFinding],
) -> Result<()> {
    let token = ctx.registry.get_access_token(installation_id).await?;
    let body = format_summary_comment(findings);
    ctx.provider
        .post_pr_comment(&token, repo_owner, repo_name, pr_number, &body)
        .await
}

fn format_summary_comment(findings: &[DraftFinding]) -> String {
    if findings.is_empty() {
        return "**Automated review complete**\n\n\
                No issues found in this pull request."
            .to_string();
    }

    let totals = SessionTotals::from_findings(findings);
    let mut body = format!(
        "**Automated review complete**\n\n\
         Found {} issue(s), {} critical.\n",
        totals.total_issues, totals.critical_issues
    );

    for finding in findings {
        let location = match (&finding.file_path, finding.line_number) {
            (Some(path), Some(line)) => format!(" ({path}:{line})"),
            (Some(path), None) => format!(" ({path})"),
            _ => String::new(),
        };
        body.push_str(&format!(
            "\n- **{}** {}{}",
            finding.severity, finding.title, location
        ));
    }

    body
}
