//! Unlock request queue.
//!
//! Requests are appended in creation order and addressed by id (`index + 1`).
//! A request is eligible once `now >= request_time + lock_period`.
//!
//! # State machine
//!
//! ```text
//! Pending --(lock period elapsed)--> eligible --(settled by trade)--> Fulfilled
//!    \--(owner cancel, when enabled)--> Cancelled
//! ```
//!
//! `Fulfilled` and `Cancelled` are terminal. A cursor tracks the first request
//! that may still be pending so pagination skips the closed prefix.

use crate::vault::error::VaultError;
use crate::vault::fixed_point::Shares;
use crate::vault::types::{Address, TargetId, UnlockRequest, UnlockStatus};

/// Seven days.
pub const DEFAULT_UNLOCK_LOCK_PERIOD_SECS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockQueue {
    requests: Vec<UnlockRequest>,
    cursor: usize,
    lock_period_secs: i64,
    allow_cancel: bool,
}

impl UnlockQueue {
    pub fn new(lock_period_secs: i64, allow_cancel: bool) -> Self {
        Self {
            requests: Vec::new(),
            cursor: 0,
            lock_period_secs: lock_period_secs.max(0),
            allow_cancel,
        }
    }

    /// Rebuild from persisted requests. Ids must run 1..=n without gaps or
    /// duplicates; they are never renumbered.
    pub fn from_requests(
        mut requests: Vec<UnlockRequest>,
        lock_period_secs: i64,
        allow_cancel: bool,
    ) -> Result<Self, VaultError> {
        requests.sort_by_key(|r| r.id);
        for (i, req) in requests.iter().enumerate() {
            let expected = i as u64 + 1;
            if req.id != expected {
                return Err(VaultError::Storage {
                    reason: format!(
                        "unlock request ids out of sequence: expected {}, found {}",
                        expected, req.id
                    ),
                });
            }
        }
        let mut queue = Self {
            requests,
            cursor: 0,
            lock_period_secs: lock_period_secs.max(0),
            allow_cancel,
        };
        queue.advance_cursor();
        Ok(queue)
    }

    pub fn lock_period_secs(&self) -> i64 {
        self.lock_period_secs
    }

    pub fn allow_cancel(&self) -> bool {
        self.allow_cancel
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn next_request_id(&self) -> u64 {
        self.requests.len() as u64 + 1
    }

    pub fn get(&self, request_id: u64) -> Option<&UnlockRequest> {
        if request_id == 0 {
            return None;
        }
        self.requests.get((request_id - 1) as usize)
    }

    pub fn requests(&self) -> &[UnlockRequest] {
        &self.requests
    }

    pub fn pending_count(&self) -> usize {
        self.requests[self.cursor..]
            .iter()
            .filter(|r| r.is_pending())
            .count()
    }

    /// Append a pending request and return its id.
    pub fn enqueue(&mut self, user: &Address, target_id: TargetId, shares: Shares, now: i64) -> u64 {
        let id = self.next_request_id();
        self.requests.push(UnlockRequest {
            id,
            user: user.clone(),
            target_id,
            shares,
            request_time: now,
            status: UnlockStatus::Pending,
            fulfilled_at: None,
        });
        id
    }

    /// Up to `max_count` pending, eligible requests in creation order.
    pub fn pending(&self, now: i64, max_count: usize) -> Vec<UnlockRequest> {
        self.requests[self.cursor..]
            .iter()
            .filter(|r| r.is_eligible(now, self.lock_period_secs))
            .take(max_count)
            .cloned()
            .collect()
    }

    /// Check that a trade for (`user`, `target_id`) may close `request_id` now.
    /// Returns the shares the request earmarked.
    pub fn check_fulfilment(
        &self,
        request_id: u64,
        user: &Address,
        target_id: &TargetId,
        now: i64,
    ) -> Result<Shares, VaultError> {
        let req = self
            .get(request_id)
            .ok_or(VaultError::UnlockRequestNotFound { request_id })?;
        if !req.is_pending() {
            return Err(VaultError::UnlockRequestAlreadyClosed { request_id });
        }
        if &req.user != user {
            return Err(VaultError::UnlockRequestMismatch {
                request_id,
                reason: format!("request belongs to {}, trade is for {}", req.user, user),
            });
        }
        if &req.target_id != target_id {
            return Err(VaultError::UnlockRequestMismatch {
                request_id,
                reason: format!("request targets {}, trade targets {}", req.target_id, target_id),
            });
        }
        if !req.is_eligible(now, self.lock_period_secs) {
            return Err(VaultError::UnlockRequestNotEligible {
                request_id,
                eligible_at: req.eligible_at(self.lock_period_secs),
            });
        }
        Ok(req.shares)
    }

    /// Close previously checked requests.
    pub fn mark_fulfilled(&mut self, request_ids: &[u64], now: i64) {
        for id in request_ids {
            if let Some(req) = id
                .checked_sub(1)
                .and_then(|i| self.requests.get_mut(i as usize))
            {
                req.status = UnlockStatus::Fulfilled;
                req.fulfilled_at = Some(now);
            }
        }
        self.advance_cursor();
    }

    /// Check that `caller` may cancel `request_id`. Returns the request.
    pub fn check_cancel(&self, caller: &Address, request_id: u64) -> Result<UnlockRequest, VaultError> {
        if !self.allow_cancel {
            return Err(VaultError::UnlockCancelDisabled);
        }
        let req = self
            .get(request_id)
            .ok_or(VaultError::UnlockRequestNotFound { request_id })?;
        if !req.is_pending() {
            return Err(VaultError::UnlockRequestAlreadyClosed { request_id });
        }
        if &req.user != caller {
            return Err(VaultError::UnlockRequestMismatch {
                request_id,
                reason: format!("{} does not own this request", caller),
            });
        }
        Ok(req.clone())
    }

    pub fn mark_cancelled(&mut self, request_id: u64) {
        if let Some(req) = request_id
            .checked_sub(1)
            .and_then(|i| self.requests.get_mut(i as usize))
        {
            req.status = UnlockStatus::Cancelled;
        }
        self.advance_cursor();
    }

    fn advance_cursor(&mut self) {
        while self.cursor < self.requests.len() && !self.requests[self.cursor].is_pending() {
            self.cursor += 1;
        }
    }
}
