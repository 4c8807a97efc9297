//! Fixed-interval poll loop.
//!
//! `IdleWait → Fetching → Processing { index, total } → Sleeping → Fetching …`
//! until the shutdown signal fires. Shutdown is observed during the sleep
//! and between messages; a message already in flight runs to completion.
//!
//! Messages that stay unread after being handled (blocked senders, failed
//! sends) are tracked in a [`Backlog`] so they never crowd fresh mail out of
//! a `max_per_cycle` batch.

use std::collections::HashSet;
use std::fmt;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::context::AppContext;
use crate::error::MailboxError;
use crate::pipeline::processor::process_message;
use crate::pipeline::types::{CycleReport, FollowUp, MessageOutcome};

/// Where the loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Started, nothing fetched yet.
    IdleWait,
    Fetching,
    /// Working through message `index` (1-based) of `total`.
    Processing { index: usize, total: usize },
    Sleeping,
}

impl fmt::Display for PollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdleWait => write!(f, "idle"),
            Self::Fetching => write!(f, "fetching"),
            Self::Processing { index, total } => write!(f, "processing {index}/{total}"),
            Self::Sleeping => write!(f, "sleeping"),
        }
    }
}

/// Unread ids this process has already handled once.
#[derive(Debug, Default)]
pub struct Backlog {
    ignored: HashSet<String>,
    retry: HashSet<String>,
}

impl Backlog {
    /// Listing size that leaves room for `max` fresh ids behind every
    /// backlogged one, whatever order the mailbox lists in.
    pub fn listing_limit(&self, max: u32) -> u32 {
        let tracked = u32::try_from(self.ignored.len() + self.retry.len()).unwrap_or(u32::MAX);
        max.saturating_add(tracked)
    }

    /// This cycle's batch: ignored ids dropped, fresh ids ahead of retries,
    /// at most `max`.
    pub fn select(&self, listed: &[String], max: usize) -> Vec<String> {
        let (retries, fresh): (Vec<String>, Vec<String>) = listed
            .iter()
            .filter(|id| !self.ignored.contains(id.as_str()))
            .cloned()
            .partition(|id| self.retry.contains(id));
        fresh.into_iter().chain(retries).take(max).collect()
    }

    pub fn record(&mut self, outcome: &MessageOutcome) {
        let id = outcome.id();
        match outcome.follow_up() {
            FollowUp::Done => {
                self.retry.remove(id);
                self.ignored.remove(id);
            }
            FollowUp::Retry => {
                self.retry.insert(id.to_string());
            }
            FollowUp::Ignore => {
                self.retry.remove(id);
                self.ignored.insert(id.to_string());
            }
        }
    }

    /// Forget ids missing from a complete listing; they were read or removed
    /// elsewhere.
    pub fn retain_listed(&mut self, listed: &[String]) {
        let listed: HashSet<&str> = listed.iter().map(String::as_str).collect();
        self.ignored.retain(|id| listed.contains(id.as_str()));
        self.retry.retain(|id| listed.contains(id.as_str()));
    }

    pub fn is_ignored(&self, id: &str) -> bool {
        self.ignored.contains(id)
    }
}

/// Drives poll cycles against an `AppContext`.
pub struct PollLoop<'a> {
    ctx: &'a AppContext,
    state: PollState,
    shutdown: watch::Receiver<bool>,
    backlog: Backlog,
}

impl<'a> PollLoop<'a> {
    pub fn new(ctx: &'a AppContext, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            ctx,
            state: PollState::IdleWait,
            shutdown,
            backlog: Backlog::default(),
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    fn set_state(&mut self, state: PollState) {
        debug!(from = %self.state, to = %state, "Poll state");
        self.state = state;
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// One fetch-and-process pass. Only a failed listing is an error; every
    /// per-message failure is recorded in the report.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, MailboxError> {
        self.set_state(PollState::Fetching);
        let max = self.ctx.settings.max_per_cycle;
        let limit = self.backlog.listing_limit(max);
        let listed = self.ctx.mailbox.list_unread(limit).await?;
        if listed.len() < limit as usize {
            self.backlog.retain_listed(&listed);
        }
        let ids = self.backlog.select(&listed, max as usize);

        let mut report = CycleReport {
            listed: listed.len(),
            ignored: listed.iter().filter(|id| self.backlog.is_ignored(id)).count(),
            ..Default::default()
        };

        if ids.is_empty() {
            info!(
                ignored = report.ignored,
                "📭 No new mail. (Checking again in {}s)",
                self.ctx.settings.poll_interval.as_secs()
            );
            return Ok(report);
        }

        let total = ids.len();
        for (i, id) in ids.iter().enumerate() {
            if self.shutdown_requested() {
                info!(remaining = total - i, "Shutdown requested; stopping cycle early");
                break;
            }
            self.set_state(PollState::Processing { index: i + 1, total });
            let outcome = process_message(self.ctx, id).await;
            debug!(id = %outcome.id(), ?outcome, "Message processed");
            report.record(&outcome);
            self.backlog.record(&outcome);
        }

        info!(
            listed = report.listed,
            replied = report.replied,
            fallback = report.fallback_replies,
            send_failures = report.send_failures,
            skipped = report.skipped,
            ignored = report.ignored,
            errors = report.errors,
            "Cycle complete"
        );
        Ok(report)
    }

    /// Poll until shutdown. Returns the number of completed cycles.
    pub async fn run(&mut self) -> u64 {
        let interval = self.ctx.settings.poll_interval;
        let mut cycles = 0u64;

        loop {
            if self.shutdown_requested() {
                break;
            }

            if let Err(e) = self.run_cycle().await {
                error!(mailbox = self.ctx.mailbox.name(), error = %e, "Failed to list unread messages");
            }
            cycles += 1;

            self.set_state(PollState::Sleeping);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = self.shutdown.changed() => {
                    // A dropped sender also ends the loop.
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(cycles, "Poll loop stopped");
        cycles
    }
}
