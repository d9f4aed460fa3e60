//! Background removal of expired and orphaned tickets.
//!
//! Storage TTLs already evict most dead records. The sweeper covers the
//! rest: tickets whose policy expired while their storage TTL was extended
//! by the expired-ticket retention, tickets without storage TTL, and
//! orphans left behind by a best-effort cascade.

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    clock::Clock,
    error::TicketResult,
    registry::TicketRegistry,
    ticket::{Ticket, TicketId},
};

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired tickets deleted (with their descendants).
    pub expired_removed: usize,
    /// Tickets deleted because their parent was gone.
    pub orphans_removed: usize,
    /// Per-ticket deletions that failed.
    pub errors: usize,
}

/// Periodic expired-ticket sweeper.
#[derive(Debug)]
pub struct TicketSweeper {
    registry: Arc<dyn TicketRegistry>,
    clock: Arc<dyn Clock>,
    cancel_token: CancellationToken,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    sweeps: AtomicU64,
}

impl TicketSweeper {
    /// Creates an idle sweeper; call [`start`](Self::start) to schedule it.
    pub fn new(registry: Arc<dyn TicketRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            clock,
            cancel_token: CancellationToken::new(),
            handle: Mutex::new(None),
            sweeps: AtomicU64::new(0),
        }
    }

    /// Runs one sweep.
    ///
    /// Failures to delete individual tickets are logged and counted in the
    /// report; only a failure to list tickets fails the sweep.
    ///
    /// # Errors
    ///
    /// Returns the registry error if the ticket listing fails.
    #[tracing::instrument(skip_all)]
    pub async fn run_once(&self) -> TicketResult<SweepReport> {
        let now = self.clock.now();
        let tickets: Vec<Ticket> = self.registry.get_tickets(Box::new(|_| true)).await?.collect();
        let present: HashSet<TicketId> = tickets.iter().map(|t| t.id().clone()).collect();

        let mut report = SweepReport::default();
        for ticket in &tickets {
            let orphaned = ticket.parent_id().is_some_and(|parent| !present.contains(parent));
            let expired = ticket.is_expired(now);
            if !expired && !orphaned {
                continue;
            }
            match self.registry.delete_ticket(ticket.id()).await {
                Ok(true) if expired => report.expired_removed += 1,
                Ok(true) => report.orphans_removed += 1,
                // Already removed by an earlier cascade in this sweep.
                Ok(false) => {},
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(
                        ticket_id = %ticket.id(),
                        error = %e,
                        "sweeper failed to delete ticket"
                    );
                },
            }
        }

        self.sweeps.fetch_add(1, Ordering::Relaxed);
        if report != SweepReport::default() {
            tracing::info!(
                expired_removed = report.expired_removed,
                orphans_removed = report.orphans_removed,
                errors = report.errors,
                "ticket sweep completed"
            );
        }
        Ok(report)
    }

    /// Schedules [`run_once`](Self::run_once) every `interval` until
    /// [`shutdown`](Self::shutdown) is called.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    #[must_use]
    pub fn start(self: Arc<Self>, interval: Duration) -> Arc<Self> {
        let sweeper = Arc::downgrade(&self);
        let token = self.cancel_token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; consume it so the first
            // sweep happens after a full interval.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("ticket sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(sweeper) = sweeper.upgrade() else {
                            break;
                        };
                        if let Err(e) = sweeper.run_once().await {
                            tracing::warn!(error = %e, "ticket sweep failed");
                        }
                    }
                }
            }
        });

        *self.handle.lock() = Some(handle);
        self
    }

    /// Stops the background task and waits for it to finish.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "ticket sweeper task ended abnormally");
        }
    }

    /// Returns the cancellation token of the background task.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Returns the number of completed sweeps.
    #[must_use]
    pub fn sweep_count(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }
}

impl Drop for TicketSweeper {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
