//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "JSON-RPC session client over WebSocket."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;

/// One request awaiting its response.
///
/// `R` is whatever the owner needs to settle it (a oneshot sender, a marker
/// for internally issued requests, ...).
#[derive(Debug)]
pub struct PendingRequest<R> {
    pub id: String,
    pub method: String,
    pub issued_at: Instant,
    pub timeout: Duration,
    pub reply: R,
    timer: Option<AbortHandle>,
}

impl<R> PendingRequest<R> {
    pub fn new(id: impl Into<String>, method: impl Into<String>, timeout: Duration, reply: R) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            issued_at: Instant::now(),
            timeout,
            reply,
            timer: None,
        }
    }

    /// Time since the request was registered.
    pub fn elapsed(&self) -> Duration {
        self.issued_at.elapsed()
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Registration refused because the id is already in flight.
#[derive(Debug)]
pub struct DuplicateId<R>(pub PendingRequest<R>);

/// Table of in-flight requests keyed by correlation id.
///
/// Every entry leaves the table exactly once, through [`resolve`](Self::resolve),
/// [`expire`](Self::expire), [`take_where`](Self::take_where) or
/// [`drain`](Self::drain). Leaving by any path other than `expire` aborts the
/// entry's timer.
#[derive(Debug)]
pub struct Correlator<R> {
    pending: HashMap<String, PendingRequest<R>>,
}

impl<R> Default for Correlator<R> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }
}

impl<R> Correlator<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a pending request. At most one entry per id.
    pub fn register(&mut self, request: PendingRequest<R>) -> Result<(), DuplicateId<R>> {
        if self.pending.contains_key(&request.id) {
            return Err(DuplicateId(request));
        }
        self.pending.insert(request.id.clone(), request);
        Ok(())
    }

    /// Attach the timeout task of a registered entry. Returns `false` and
    /// aborts the timer when the entry is already gone.
    pub fn arm(&mut self, id: &str, timer: AbortHandle) -> bool {
        match self.pending.get_mut(id) {
            Some(entry) => {
                entry.cancel_timer();
                entry.timer = Some(timer);
                true
            }
            None => {
                timer.abort();
                false
            }
        }
    }

    /// Remove the entry answered by a response.
    pub fn resolve(&mut self, id: &str) -> Option<PendingRequest<R>> {
        let mut entry = self.pending.remove(id)?;
        entry.cancel_timer();
        Some(entry)
    }

    /// Remove the entry whose timer fired.
    pub fn expire(&mut self, id: &str) -> Option<PendingRequest<R>> {
        let mut entry = self.pending.remove(id)?;
        entry.timer = None;
        Some(entry)
    }

    /// Remove every entry matching `predicate`.
    pub fn take_where<F>(&mut self, mut predicate: F) -> Vec<PendingRequest<R>>
    where
        F: FnMut(&PendingRequest<R>) -> bool,
    {
        let ids: Vec<String> = self
            .pending
            .values()
            .filter(|entry| predicate(entry))
            .map(|entry| entry.id.clone())
            .collect();
        ids.iter().filter_map(|id| self.resolve(id)).collect()
    }

    /// Remove every entry, e.g. when the connection is lost.
    pub fn drain(&mut self) -> Vec<PendingRequest<R>> {
        self.pending
            .drain()
            .map(|(_, mut entry)| {
                entry.cancel_timer();
                entry
            })
            .collect()
    }

    /// Whether any pending entry matches `predicate`.
    pub fn any<F>(&self, predicate: F) -> bool
    where
        F: FnMut(&PendingRequest<R>) -> bool,
    {
        self.pending.values().any(predicate)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
