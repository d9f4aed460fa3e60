//! Ticket registry: persistence of tickets on top of a [`StorageBackend`].
//!
//! # Storage layout
//!
//! | Key | Value | TTL |
//! |-----|-------|-----|
//! | `ticket/{id}` | JSON [`Ticket`] | policy remaining + expired retention, or the catalog override |
//! | `ticket-children/{parent}/{child}` | empty | same as the child |
//!
//! The child index drives cascade deletion: deleting a ticket walks the
//! index breadth-first and removes the whole subtree in one transaction.
//!
//! # Consistency
//!
//! Every state transition is a conditional write against the stored bytes,
//! so concurrent writers never overwrite each other:
//!
//! - insert is insert-if-absent (a conflict means [`TicketError::DuplicateId`])
//! - consumption of single-use tickets is compare-and-set on the unconsumed
//!   record; of N concurrent consumers exactly one wins
//! - a use of a multi-use ticket re-applies the throttle to the freshest
//!   stored record on every retry, so a burst cannot slip past the minimum
//!   interval by reading the same snapshot
//! - deletion is compare-and-delete on the root plus plain deletes of the
//!   subtree, committed atomically
//!
//! Every call runs under the registry's request timeout. Because each call
//! commits at most one atomic storage operation, a timed-out call leaves
//! either the complete outcome or nothing. Contended read-modify-write calls
//! keep retrying until that deadline and then fail with
//! [`TicketError::Timeout`].

use std::{
    collections::{HashSet, VecDeque},
    fmt,
    future::Future,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sso_ticket_storage::{KeyValue, StorageBackend, StorageError, StorageResult, Transaction};

use crate::{
    catalog::{TicketCatalog, TicketDefinition},
    clock::Clock,
    error::{TicketError, TicketResult},
    expiration::ExpirationPolicy,
    ticket::{Ticket, TicketId, TicketKind},
};

const TICKET_PREFIX: &str = "ticket/";
const CHILDREN_PREFIX: &str = "ticket-children/";

/// Default deadline for a registry call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time an expired ticket stays in storage.
pub const DEFAULT_EXPIRED_RETENTION: Duration = Duration::from_secs(300);

/// Maximum ancestors inspected when checking a ticket's parent chain.
pub const MAX_CHAIN_DEPTH: usize = 16;

/// Attempts at consuming or deleting a contended ticket before settling.
const MAX_WRITE_ATTEMPTS: usize = 4;

/// Upper bound on descendants removed by one cascade.
const MAX_CASCADE: usize = 10_000;

/// Predicate used to select tickets in [`TicketRegistry::get_tickets`].
pub type TicketPredicate = Box<dyn Fn(&Ticket) -> bool + Send + Sync>;

fn ticket_key(id: &TicketId) -> Vec<u8> {
    format!("{TICKET_PREFIX}{id}").into_bytes()
}

fn children_prefix(parent: &TicketId) -> Vec<u8> {
    format!("{CHILDREN_PREFIX}{parent}/").into_bytes()
}

fn child_index_key(parent: &TicketId, child: &TicketId) -> Vec<u8> {
    format!("{CHILDREN_PREFIX}{parent}/{child}").into_bytes()
}

fn encode(ticket: &Ticket) -> TicketResult<Vec<u8>> {
    serde_json::to_vec(ticket).map_err(|e| TicketError::serialization("encode ticket", e))
}

fn decode(raw: &[u8]) -> TicketResult<Ticket> {
    serde_json::from_slice(raw).map_err(|e| TicketError::serialization("decode ticket", e))
}

/// Storage-facing CRUD for tickets.
///
/// Implementations must be safe to call concurrently from independent
/// request handlers.
#[async_trait]
pub trait TicketRegistry: Send + Sync + fmt::Debug {
    /// Stores a new ticket.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::DuplicateId`] if a ticket with the same ID
    /// already exists.
    async fn add_ticket(&self, ticket: &Ticket) -> TicketResult<()>;

    /// Loads a live ticket of the expected kind.
    ///
    /// # Errors
    ///
    /// - [`TicketError::NotFound`] if absent or evicted
    /// - [`TicketError::TypeMismatch`] if stored with a different kind
    /// - [`TicketError::Expired`] if the ticket or one of its ancestors has
    ///   expired or is gone; an expired entry is removed opportunistically
    async fn get_ticket(&self, id: &TicketId, expected: TicketKind) -> TicketResult<Ticket>;

    /// Loads the stored record without any validity checks.
    async fn find_ticket(&self, id: &TicketId) -> TicketResult<Option<Ticket>>;

    /// Persists lifecycle changes (last use, usage count, consumed flag).
    ///
    /// Creation-time fields of the stored record always win; the lifecycle
    /// clock and the consumed flag only move forward.
    ///
    /// # Errors
    ///
    /// [`TicketError::NotFound`] if the ticket is gone and
    /// [`TicketError::Expired`] if it has already expired.
    async fn update_ticket(&self, ticket: &Ticket) -> TicketResult<()>;

    /// Atomically records a use of a live multi-use ticket and returns the
    /// stored result. The throttle is checked against the stored record, and
    /// the returned usage count includes this use, so exactly one caller
    /// ever sees a count of 1.
    ///
    /// # Errors
    ///
    /// The errors of [`get_ticket`](Self::get_ticket), plus
    /// [`TicketError::ThrottledReplay`] inside the policy's minimum interval
    /// and [`TicketError::AlreadyConsumed`] for a consumed ticket.
    async fn touch_ticket(&self, id: &TicketId, expected: TicketKind) -> TicketResult<Ticket>;

    /// Atomically records that a proxy-granting ticket is being granted on
    /// the strength of a validated service or proxy ticket. Succeeds at most
    /// once per ticket.
    ///
    /// # Errors
    ///
    /// The errors of [`get_ticket`](Self::get_ticket), plus
    /// [`TicketError::AuthorizationDenied`] if the ticket was never validated
    /// or a grant was already claimed.
    async fn claim_proxy_grant(
        &self,
        id: &TicketId,
        expected: TicketKind,
    ) -> TicketResult<Ticket>;

    /// Atomically marks a single-use ticket as consumed and returns it.
    ///
    /// # Errors
    ///
    /// The errors of [`get_ticket`](Self::get_ticket), plus
    /// [`TicketError::AlreadyConsumed`] for every caller but the one that
    /// consumed it.
    async fn consume_ticket(&self, id: &TicketId, expected: TicketKind) -> TicketResult<Ticket>;

    /// Deletes a ticket and every descendant. Idempotent; returns whether
    /// the ticket itself was removed.
    async fn delete_ticket(&self, id: &TicketId) -> TicketResult<bool>;

    /// Returns every decodable ticket matching `predicate`, including
    /// expired ones. Records are decoded lazily as the iterator advances.
    async fn get_tickets(&self, predicate: TicketPredicate) -> TicketResult<TicketIter>;
}

/// Runs `fut` under a deadline, failing with [`TicketError::Timeout`] once
/// it elapses. The future is dropped at the deadline, so only operations
/// that commit atomically may be wrapped.
pub async fn with_deadline<T>(
    operation: &'static str,
    deadline: Duration,
    fut: impl Future<Output = TicketResult<T>>,
) -> TicketResult<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, timeout_ms = deadline.as_millis() as u64, "call timed out");
            Err(TicketError::Timeout)
        },
    }
}

/// Mints a ticket with a fresh identifier from `definition` and stores it,
/// regenerating the identifier on collision.
///
/// # Errors
///
/// Returns [`TicketError::GenerationExhausted`] once `max_attempts`
/// identifiers have collided, otherwise the errors of
/// [`TicketRegistry::add_ticket`].
pub async fn create_ticket<F>(
    registry: &dyn TicketRegistry,
    definition: &TicketDefinition,
    max_attempts: u32,
    build: F,
) -> TicketResult<Ticket>
where
    F: Fn(TicketId, ExpirationPolicy) -> Ticket + Send + Sync,
{
    for attempt in 1..=max_attempts {
        let ticket = build(definition.generate_id(), definition.expiration_policy());
        match registry.add_ticket(&ticket).await {
            Ok(()) => return Ok(ticket),
            Err(TicketError::DuplicateId { id }) => {
                tracing::warn!(
                    ticket_id = %id,
                    attempt,
                    "generated ticket id collided, regenerating"
                );
            },
            Err(e) => return Err(e),
        }
    }
    Err(TicketError::GenerationExhausted { kind: definition.kind(), attempts: max_attempts })
}

/// Lazy iterator over stored tickets.
pub struct TicketIter {
    records: std::vec::IntoIter<KeyValue>,
    predicate: TicketPredicate,
}

impl TicketIter {
    fn new(records: Vec<KeyValue>, predicate: TicketPredicate) -> Self {
        Self { records: records.into_iter(), predicate }
    }
}

impl fmt::Debug for TicketIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketIter").field("remaining", &self.records.len()).finish_non_exhaustive()
    }
}

impl Iterator for TicketIter {
    type Item = Ticket;

    fn next(&mut self) -> Option<Ticket> {
        for record in self.records.by_ref() {
            match decode(&record.value) {
                Ok(ticket) if (self.predicate)(&ticket) => return Some(ticket),
                Ok(_) => {},
                Err(e) => tracing::warn!(
                    key = %String::from_utf8_lossy(&record.key),
                    error = %e,
                    "skipping undecodable ticket record"
                ),
            }
        }
        None
    }
}

/// Why a ticket's parent chain is no longer valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BrokenLink {
    pub(crate) ancestor: TicketId,
    pub(crate) reason: &'static str,
}

/// Registry over any [`StorageBackend`].
pub struct DefaultTicketRegistry<B> {
    backend: Arc<B>,
    catalog: Arc<TicketCatalog>,
    clock: Arc<dyn Clock>,
    request_timeout: Duration,
    expired_retention: Duration,
}

impl<B> fmt::Debug for DefaultTicketRegistry<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultTicketRegistry")
            .field("catalog", &self.catalog)
            .field("clock", &self.clock)
            .field("request_timeout", &self.request_timeout)
            .field("expired_retention", &self.expired_retention)
            .finish_non_exhaustive()
    }
}

impl<B: StorageBackend + 'static> DefaultTicketRegistry<B> {
    /// Creates a registry with default timeouts.
    pub fn new(backend: Arc<B>, catalog: Arc<TicketCatalog>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            catalog,
            clock,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            expired_retention: DEFAULT_EXPIRED_RETENTION,
        }
    }

    /// Sets the deadline applied to every call.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets how long expired tickets are retained in storage.
    #[must_use]
    pub fn with_expired_retention(mut self, retention: Duration) -> Self {
        self.expired_retention = retention;
        self
    }

    /// Returns the storage backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    async fn within<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = TicketResult<T>> + Send,
    ) -> TicketResult<T> {
        with_deadline(operation, self.request_timeout, fut).await
    }

    /// Storage TTL for a record, so backend eviction trails logical expiry.
    fn storage_ttl(&self, ticket: &Ticket, now: DateTime<Utc>) -> Option<Duration> {
        if let Some(timeout) = self
            .catalog
            .find_for_ticket(ticket)
            .ok()
            .and_then(|definition| definition.storage_timeout_override())
        {
            return Some(timeout);
        }
        ticket
            .expiration_policy()
            .remaining(ticket.creation_time(), ticket.last_used_time(), now)
            .map(|remaining| remaining.saturating_add(self.expired_retention))
    }

    async fn load(&self, id: &TicketId) -> TicketResult<Option<(Vec<u8>, Ticket)>> {
        let Some(raw) = self.backend.get(&ticket_key(id)).await? else {
            return Ok(None);
        };
        let ticket = decode(&raw)?;
        Ok(Some((raw.to_vec(), ticket)))
    }

    /// Walks the parent chain up to the root. Every ancestor must exist and
    /// be unexpired.
    pub(crate) async fn check_ancestry(
        &self,
        ticket: &Ticket,
        now: DateTime<Utc>,
    ) -> TicketResult<Result<(), BrokenLink>> {
        let mut next = ticket.parent_id().cloned();
        let mut depth = 0;
        while let Some(parent_id) = next {
            depth += 1;
            if depth > MAX_CHAIN_DEPTH {
                return Ok(Err(BrokenLink { ancestor: parent_id, reason: "chain too deep" }));
            }
            let Some((_, parent)) = self.load(&parent_id).await? else {
                return Ok(Err(BrokenLink { ancestor: parent_id, reason: "ancestor is gone" }));
            };
            if parent.is_expired(now) {
                return Ok(Err(BrokenLink { ancestor: parent_id, reason: "ancestor expired" }));
            }
            next = parent.parent_id().cloned();
        }
        Ok(Ok(()))
    }

    /// Removes an expired record without failing the caller.
    async fn evict_expired(&self, id: &TicketId) {
        if let Err(e) = self.backend.delete(&ticket_key(id)).await {
            tracing::warn!(ticket_id = %id, error = %e, "failed to evict expired ticket");
        }
    }

    /// Loads and validates a ticket; shared by `get_ticket` and
    /// `consume_ticket`.
    async fn load_valid(
        &self,
        id: &TicketId,
        expected: TicketKind,
        now: DateTime<Utc>,
        reject_consumed: bool,
    ) -> TicketResult<(Vec<u8>, Ticket)> {
        let (raw, ticket) = self.load(id).await?.ok_or_else(|| TicketError::not_found(id))?;
        if ticket.kind() != expected {
            return Err(TicketError::TypeMismatch {
                id: id.to_string(),
                expected,
                actual: ticket.kind(),
            });
        }
        if reject_consumed && ticket.is_consumed() {
            return Err(TicketError::already_consumed(id));
        }
        if ticket.is_expired(now) {
            self.evict_expired(id).await;
            return Err(TicketError::expired(id));
        }
        if let Err(broken) = self.check_ancestry(&ticket, now).await? {
            tracing::debug!(
                ticket_id = %id,
                ancestor = %broken.ancestor,
                reason = broken.reason,
                "ticket invalid through its parent chain"
            );
            return Err(TicketError::expired(id));
        }
        Ok((raw, ticket))
    }

    async fn add(&self, ticket: &Ticket) -> TicketResult<()> {
        let now = self.clock.now();
        let ttl = self.storage_ttl(ticket, now);
        let value = encode(ticket)?;

        let mut txn = self.backend.transaction().await?;
        txn.compare_and_set(ticket_key(ticket.id()), None, value, ttl)?;
        if let Some(parent) = ticket.parent_id() {
            let index = child_index_key(parent, ticket.id());
            match ttl {
                Some(ttl) => txn.set_with_ttl(index, Vec::new(), ttl),
                None => txn.set(index, Vec::new()),
            }
        }

        match txn.commit().await {
            Ok(()) => {
                tracing::info!(
                    audit.action = "create_ticket",
                    audit.resource = %ticket.id(),
                    audit.result = "success",
                    kind = %ticket.kind(),
                    "audit_event"
                );
                Ok(())
            },
            Err(StorageError::Conflict) => Err(TicketError::duplicate_id(ticket.id())),
            Err(e) => Err(e.into()),
        }
    }

    /// Compare-and-sets `ticket` over the stored bytes `raw`, refreshing the
    /// child index entry so it keeps trailing the record.
    async fn write_back(
        &self,
        raw: Vec<u8>,
        ticket: &Ticket,
        now: DateTime<Utc>,
    ) -> TicketResult<StorageResult<()>> {
        let id = ticket.id();
        let ttl = self.storage_ttl(ticket, now);
        let mut txn = self.backend.transaction().await?;
        txn.compare_and_set(ticket_key(id), Some(raw), encode(ticket)?, ttl)?;
        if let Some(parent) = ticket.parent_id() {
            let index = child_index_key(parent, id);
            match ttl {
                Some(ttl) => txn.set_with_ttl(index, Vec::new(), ttl),
                None => txn.set(index, Vec::new()),
            }
        }
        Ok(txn.commit().await)
    }

    async fn update(&self, update: &Ticket) -> TicketResult<()> {
        let id = update.id();
        loop {
            let now = self.clock.now();
            let (raw, stored) = self.load(id).await?.ok_or_else(|| TicketError::not_found(id))?;
            if stored.kind() != update.kind() {
                return Err(TicketError::TypeMismatch {
                    id: id.to_string(),
                    expected: update.kind(),
                    actual: stored.kind(),
                });
            }
            if stored.is_expired(now) {
                return Err(TicketError::expired(id));
            }

            let mut merged = stored.clone();
            merged.absorb_lifecycle(update);
            if merged == stored {
                return Ok(());
            }

            match self.write_back(raw, &merged, now).await? {
                Ok(()) => return Ok(()),
                Err(StorageError::Conflict) => {
                    tracing::debug!(ticket_id = %id, "update raced with another writer, retrying");
                    tokio::task::yield_now().await;
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Applies `change` to the freshest stored record and writes it back,
    /// re-reading and re-applying on every conflict until the request
    /// deadline cuts the loop off.
    async fn modify<F>(
        &self,
        id: &TicketId,
        expected: TicketKind,
        reject_consumed: bool,
        change: F,
    ) -> TicketResult<Ticket>
    where
        F: Fn(&mut Ticket, DateTime<Utc>) -> TicketResult<()> + Send + Sync,
    {
        loop {
            let now = self.clock.now();
            let (raw, mut ticket) = self.load_valid(id, expected, now, reject_consumed).await?;
            change(&mut ticket, now)?;
            match self.write_back(raw, &ticket, now).await? {
                Ok(()) => return Ok(ticket),
                Err(StorageError::Conflict) => {
                    tracing::debug!(ticket_id = %id, "ticket changed underneath, re-reading");
                    tokio::task::yield_now().await;
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn touch(&self, id: &TicketId, expected: TicketKind) -> TicketResult<Ticket> {
        let touched = self.modify(id, expected, true, Ticket::mark_used).await?;
        tracing::debug!(ticket_id = %id, usage_count = touched.usage_count(), "ticket used");
        Ok(touched)
    }

    async fn claim_grant(&self, id: &TicketId, expected: TicketKind) -> TicketResult<Ticket> {
        let outcome = self
            .modify(id, expected, false, |ticket, _| {
                if !ticket.is_consumed() {
                    return Err(TicketError::authorization_denied("ticket has not been validated"));
                }
                if ticket.proxy_granted() {
                    return Err(TicketError::authorization_denied(
                        "a proxy-granting ticket was already granted for this ticket",
                    ));
                }
                ticket.mark_proxy_granted();
                Ok(())
            })
            .await;
        if let Err(TicketError::AuthorizationDenied { reason }) = &outcome {
            tracing::info!(
                audit.action = "claim_proxy_grant",
                audit.resource = %id,
                audit.result = "denied",
                reason = %reason,
                "audit_event"
            );
        }
        outcome
    }

    async fn consume(&self, id: &TicketId, expected: TicketKind) -> TicketResult<Ticket> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let now = self.clock.now();
            let (raw, ticket) = self.load_valid(id, expected, now, true).await?;

            let mut consumed = ticket;
            consumed.mark_used(now)?;
            consumed.mark_consumed();
            let ttl = self.storage_ttl(&consumed, now);

            let value = encode(&consumed)?;
            match self.backend.compare_and_set(&ticket_key(id), Some(&raw), value, ttl).await {
                Ok(()) => {
                    tracing::info!(
                        audit.action = "consume_ticket",
                        audit.resource = %id,
                        audit.result = "success",
                        kind = %expected,
                        "audit_event"
                    );
                    return Ok(consumed);
                },
                Err(StorageError::Conflict) => {
                    tracing::debug!(ticket_id = %id, "lost consumption race, re-reading");
                    tokio::task::yield_now().await;
                },
                Err(e) => return Err(e.into()),
            }
        }
        // Single-use records only change by being consumed or deleted, so a
        // persistent conflict means another validator got there first.
        tracing::info!(
            audit.action = "consume_ticket",
            audit.resource = %id,
            audit.result = "denied",
            "audit_event"
        );
        Err(TicketError::already_consumed(id))
    }

    /// Collects the subtree under `root` from the child index.
    async fn collect_descendants(
        &self,
        root: &TicketId,
    ) -> TicketResult<(Vec<TicketId>, Vec<Vec<u8>>)> {
        let mut descendants = Vec::new();
        let mut seen = HashSet::from([root.clone()]);
        let mut index_keys = Vec::new();
        let mut queue = VecDeque::from([root.clone()]);

        while let Some(parent) = queue.pop_front() {
            let prefix = children_prefix(&parent);
            for entry in self.backend.get_prefix(&prefix).await? {
                let Some(child) = entry.key.strip_prefix(prefix.as_slice()) else {
                    continue;
                };
                let child = TicketId::new(String::from_utf8_lossy(child).into_owned());
                index_keys.push(entry.key.to_vec());
                if descendants.len() >= MAX_CASCADE {
                    tracing::warn!(root = %root, limit = MAX_CASCADE, "cascade truncated");
                    return Ok((descendants, index_keys));
                }
                if seen.insert(child.clone()) {
                    descendants.push(child.clone());
                    queue.push_back(child);
                }
            }
        }
        Ok((descendants, index_keys))
    }

    async fn delete(&self, id: &TicketId) -> TicketResult<bool> {
        let key = ticket_key(id);
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let root = self.load(id).await?;
            let (descendants, index_keys) = self.collect_descendants(id).await?;

            let mut txn = self.backend.transaction().await?;
            if let Some((raw, ticket)) = &root {
                // Compare-and-delete: the plain delete is applied after the
                // conditional write and wins.
                txn.compare_and_set(key.clone(), Some(raw.clone()), raw.clone(), None)?;
                txn.delete(key.clone());
                if let Some(parent) = ticket.parent_id() {
                    txn.delete(child_index_key(parent, id));
                }
            }
            for child in &descendants {
                txn.delete(ticket_key(child));
            }
            for index in &index_keys {
                txn.delete(index.clone());
            }

            match commit_cascade(txn).await {
                Ok(()) => {
                    tracing::info!(
                        audit.action = "delete_ticket",
                        audit.resource = %id,
                        audit.result = "success",
                        audit.cascaded = descendants.len(),
                        "audit_event"
                    );
                    return Ok(root.is_some());
                },
                Err(StorageError::Conflict) => {
                    tracing::debug!(ticket_id = %id, "ticket changed during delete, retrying");
                },
                Err(e) => {
                    tracing::warn!(
                        ticket_id = %id,
                        error = %e,
                        "cascade transaction failed, deleting ticket and descendants individually"
                    );
                    return self.delete_best_effort(id, &descendants, &index_keys).await;
                },
            }
        }
        let (descendants, index_keys) = self.collect_descendants(id).await?;
        self.delete_best_effort(id, &descendants, &index_keys).await
    }

    /// Removes the root atomically, then each descendant on its own. A
    /// descendant that cannot be removed is left as an orphan: it is already
    /// invalid through its parent chain and the sweeper collects it later.
    async fn delete_best_effort(
        &self,
        id: &TicketId,
        descendants: &[TicketId],
        index_keys: &[Vec<u8>],
    ) -> TicketResult<bool> {
        let removed = self.backend.take(&ticket_key(id)).await?.is_some();
        let mut orphaned = 0usize;
        for child in descendants {
            if let Err(e) = self.backend.delete(&ticket_key(child)).await {
                orphaned += 1;
                tracing::warn!(
                    ticket_id = %child,
                    parent = %id,
                    error = %e,
                    "failed to delete descendant"
                );
            }
        }
        for index in index_keys {
            if let Err(e) = self.backend.delete(index).await {
                tracing::warn!(
                    key = %String::from_utf8_lossy(index),
                    error = %e,
                    "failed to delete child index entry"
                );
            }
        }
        tracing::info!(
            audit.action = "delete_ticket",
            audit.resource = %id,
            audit.result = if orphaned == 0 { "success" } else { "partial" },
            audit.cascaded = descendants.len() - orphaned,
            "audit_event"
        );
        Ok(removed)
    }
}

async fn commit_cascade(txn: Box<dyn Transaction>) -> StorageResult<()> {
    fail::fail_point!("registry-cascade-commit", |_| {
        Err(StorageError::internal("injected cascade commit failure"))
    });
    txn.commit().await
}

#[async_trait]
impl<B: StorageBackend + 'static> TicketRegistry for DefaultTicketRegistry<B> {
    #[tracing::instrument(skip_all, fields(ticket_id = %ticket.id(), kind = %ticket.kind()))]
    async fn add_ticket(&self, ticket: &Ticket) -> TicketResult<()> {
        self.within("add_ticket", self.add(ticket)).await
    }

    #[tracing::instrument(skip_all, fields(ticket_id = %id, expected = %expected))]
    async fn get_ticket(&self, id: &TicketId, expected: TicketKind) -> TicketResult<Ticket> {
        self.within("get_ticket", async {
            let (_, ticket) = self.load_valid(id, expected, self.clock.now(), false).await?;
            Ok(ticket)
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(ticket_id = %id))]
    async fn find_ticket(&self, id: &TicketId) -> TicketResult<Option<Ticket>> {
        self.within("find_ticket", async { Ok(self.load(id).await?.map(|(_, ticket)| ticket)) })
            .await
    }

    #[tracing::instrument(skip_all, fields(ticket_id = %ticket.id()))]
    async fn update_ticket(&self, ticket: &Ticket) -> TicketResult<()> {
        self.within("update_ticket", self.update(ticket)).await
    }

    #[tracing::instrument(skip_all, fields(ticket_id = %id, expected = %expected))]
    async fn touch_ticket(&self, id: &TicketId, expected: TicketKind) -> TicketResult<Ticket> {
        self.within("touch_ticket", self.touch(id, expected)).await
    }

    #[tracing::instrument(skip_all, fields(ticket_id = %id, expected = %expected))]
    async fn claim_proxy_grant(
        &self,
        id: &TicketId,
        expected: TicketKind,
    ) -> TicketResult<Ticket> {
        self.within("claim_proxy_grant", self.claim_grant(id, expected)).await
    }

    #[tracing::instrument(skip_all, fields(ticket_id = %id, expected = %expected))]
    async fn consume_ticket(&self, id: &TicketId, expected: TicketKind) -> TicketResult<Ticket> {
        self.within("consume_ticket", self.consume(id, expected)).await
    }

    #[tracing::instrument(skip_all, fields(ticket_id = %id))]
    async fn delete_ticket(&self, id: &TicketId) -> TicketResult<bool> {
        self.within("delete_ticket", self.delete(id)).await
    }

    #[tracing::instrument(skip_all)]
    async fn get_tickets(&self, predicate: TicketPredicate) -> TicketResult<TicketIter> {
        self.within("get_tickets", async {
            let records = self.backend.get_prefix(TICKET_PREFIX.as_bytes()).await?;
            Ok(TicketIter::new(records, predicate))
        })
        .await
    }
}
