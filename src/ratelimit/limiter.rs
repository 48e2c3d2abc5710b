//! The rate limiting entry point used by key verification.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use uuid::Uuid;

use super::clock::Clock;
use super::coordinator::Coordinator;
use super::identifier::Identifier;
use super::lease::{duration_from_ms, timestamp_from_ms, Lease, LeaseClaims, LeaseManager};
use super::resolver::{self, LimitSource, ResolvedLimit};
use super::sliding;
use super::store::WindowStore;
use super::types::{EvaluationResult, KeyContext, LimitRequest};
use crate::error::{Result, ValidationError};

/// Result of a lease request.
///
/// `lease` is only present if the reservation was admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseOutcome {
    pub result: EvaluationResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
}

/// Evaluates limits, issues leases and settles them.
///
/// This struct is thread-safe and can be shared across request handlers;
/// none of its methods block on anything but per-bucket locks.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<WindowStore>,
    coordinator: Coordinator,
    leases: Arc<LeaseManager>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(store: Arc<WindowStore>, leases: LeaseManager, clock: Arc<dyn Clock>) -> Self {
        Self {
            coordinator: Coordinator::new(store.clone()),
            store,
            leases: Arc::new(leases),
            clock,
        }
    }

    /// Evaluate every limit that applies to this verification as one unit.
    pub fn evaluate(&self, ctx: &KeyContext, requested: &[LimitRequest]) -> Result<EvaluationResult> {
        let limits = resolver::resolve(ctx, requested)?;

        trace!(
            workspace_id = %ctx.workspace_id,
            key_id = %ctx.key_id,
            limits = limits.len(),
            "Evaluating rate limits"
        );

        Ok(self.coordinator.evaluate(&limits, self.clock.now_ms()))
    }

    /// Reserve `request.cost` on one named limit until `timeout_ms` elapses.
    ///
    /// The reservation is charged exactly like a normal evaluation. If it
    /// does not fit, the exceeded result is returned and no lease issued.
    pub fn issue_lease(
        &self,
        ctx: &KeyContext,
        request: &LimitRequest,
        timeout_ms: i64,
    ) -> Result<LeaseOutcome> {
        let timeout_ms = self.leases.validate_timeout(timeout_ms)?;
        let limit = resolver::resolve_one(ctx, request)?;

        let now_ms = self.clock.now_ms();
        let result = self.coordinator.evaluate(std::slice::from_ref(&limit), now_ms);
        if !result.success {
            return Ok(LeaseOutcome { result, lease: None });
        }

        let claims = LeaseClaims {
            lease_id: Uuid::new_v4().to_string(),
            workspace_id: ctx.workspace_id.clone(),
            config_id: limit.identifier.config_id.clone(),
            name: limit.name.clone(),
            limit: limit.limit,
            duration_ms: limit.duration_ms,
            window_start: sliding::window_start(now_ms, limit.duration_ms),
            reserved_cost: limit.cost,
            issued_at: Some(timestamp_from_ms(now_ms)),
            timeout: Some(duration_from_ms(timeout_ms)),
            auto_apply: limit.auto_apply,
        };

        debug!(
            lease_id = %claims.lease_id,
            identifier = %limit.identifier,
            reserved_cost = limit.cost,
            timeout_ms,
            "Issued lease"
        );

        let lease = Lease {
            id: claims.lease_id.clone(),
            token: self.leases.seal(&claims),
            reserved_cost: claims.reserved_cost,
            expires_at: claims.expires_at_ms(),
        };
        Ok(LeaseOutcome {
            result,
            lease: Some(lease),
        })
    }

    /// Settle a lease with the cost that was actually incurred.
    ///
    /// The bucket the reservation was charged to is adjusted by
    /// `actual_cost - reserved_cost`: unused capacity is refunded, overruns
    /// are charged in full. Overruns are not capped at the reservation, so
    /// the returned status may report the limit as exceeded.
    pub fn commit_lease(&self, workspace_id: &str, token: &str, actual_cost: i64) -> Result<EvaluationResult> {
        if actual_cost < 0 {
            return Err(ValidationError::NegativeActualCost(actual_cost).into());
        }
        let actual_cost = actual_cost as u64;

        let claims = self.leases.open(workspace_id, token)?;
        let now_ms = self.clock.now_ms();
        self.leases.claim(&claims, now_ms)?;

        let key = claims.bucket_key();
        if actual_cost > claims.reserved_cost {
            self.store.increment(&key, actual_cost - claims.reserved_cost);
        } else if actual_cost < claims.reserved_cost {
            self.store.decrement(&key, claims.reserved_cost - actual_cost);
        }

        debug!(
            lease_id = %claims.lease_id,
            key = %key,
            reserved_cost = claims.reserved_cost,
            actual_cost,
            "Committed lease"
        );

        let limit = ResolvedLimit {
            identifier: Identifier::new(claims.config_id.clone(), claims.name.clone()),
            name: claims.name.clone(),
            limit: claims.limit,
            duration_ms: claims.duration_ms,
            cost: 0,
            auto_apply: claims.auto_apply,
            source: LimitSource::Key,
        };
        let status = self.coordinator.observe(&limit, now_ms);
        Ok(EvaluationResult {
            success: !status.exceeded,
            limits: vec![status],
        })
    }

    /// Drop expired buckets and committed-lease records.
    pub fn sweep(&self) -> usize {
        let now_ms = self.clock.now_ms();
        self.store.sweep(now_ms) + self.leases.sweep(now_ms)
    }

    pub fn store(&self) -> &Arc<WindowStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("buckets", &self.store.len())
            .field("max_lease_timeout_ms", &self.leases.max_timeout_ms())
            .finish()
    }
}
