//! Works out which limits apply to one verification call.
//!
//! Order of the resolved set:
//! 1. every explicitly requested limit, in request order, matched against the
//!    key's configs first and the identity's configs second;
//! 2. the key's auto-apply configs that were not requested;
//! 3. the identity's auto-apply configs that were neither requested nor
//!    shadowed by a same-named key config.
//!
//! A key-level config always hides an identity-level config of the same
//! name. The two are never merged.

use std::collections::HashSet;

use super::identifier::Identifier;
use super::types::{KeyContext, LimitRequest, RateLimitConfig};
use crate::error::ValidationError;

/// Cost charged when a request does not name one.
pub const DEFAULT_COST: u64 = 1;

/// Where a resolved limit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitSource {
    Key,
    Identity,
    /// Limit and duration supplied inline by the caller
    AdHoc,
}

/// A limit ready for evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLimit {
    pub identifier: Identifier,
    pub name: String,
    pub limit: u32,
    pub duration_ms: u64,
    pub cost: u64,
    pub auto_apply: bool,
    pub source: LimitSource,
}

/// Resolve the full limit set for a verification.
///
/// All validation happens here, before any counter is read.
pub fn resolve(
    ctx: &KeyContext,
    requested: &[LimitRequest],
) -> Result<Vec<ResolvedLimit>, ValidationError> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(requested.len());
    let mut resolved = Vec::with_capacity(requested.len() + ctx.key_limits.len());

    for request in requested {
        if !seen.insert(request.name.as_str()) {
            return Err(ValidationError::DuplicateLimit(request.name.clone()));
        }
        resolved.push(resolve_one(ctx, request)?);
    }

    for config in ctx.key_limits.iter().filter(|c| c.auto_apply) {
        if seen.insert(config.name.as_str()) {
            resolved.push(from_config(config, DEFAULT_COST, LimitSource::Key)?);
        }
    }

    for config in ctx.identity_limits.iter().filter(|c| c.auto_apply) {
        if key_config(ctx, &config.name).is_some() {
            continue;
        }
        if seen.insert(config.name.as_str()) {
            resolved.push(from_config(config, DEFAULT_COST, LimitSource::Identity)?);
        }
    }

    Ok(resolved)
}

/// Resolve a single explicitly named limit, ignoring auto-apply configs.
pub fn resolve_one(ctx: &KeyContext, request: &LimitRequest) -> Result<ResolvedLimit, ValidationError> {
    let cost = parse_cost(request)?;
    let limit_override = request
        .limit
        .map(|limit| parse_limit(&request.name, limit))
        .transpose()?;
    let duration_override = request
        .duration
        .map(|duration| parse_duration(&request.name, duration))
        .transpose()?;

    let matched = key_config(ctx, &request.name)
        .map(|c| (c, LimitSource::Key))
        .or_else(|| identity_config(ctx, &request.name).map(|c| (c, LimitSource::Identity)));

    match (matched, limit_override, duration_override) {
        (Some((config, source)), limit, duration) => {
            let mut resolved = from_config(config, cost, source)?;
            if let Some(limit) = limit {
                resolved.limit = limit;
            }
            if let Some(duration) = duration {
                resolved.duration_ms = duration;
            }
            Ok(resolved)
        }
        (None, Some(limit), Some(duration_ms)) => Ok(ResolvedLimit {
            identifier: Identifier::new(ctx.key_id.clone(), request.name.clone()),
            name: request.name.clone(),
            limit,
            duration_ms,
            cost,
            auto_apply: false,
            source: LimitSource::AdHoc,
        }),
        (None, _, _) => Err(ValidationError::UnknownLimit(request.name.clone())),
    }
}

fn key_config<'a>(ctx: &'a KeyContext, name: &str) -> Option<&'a RateLimitConfig> {
    ctx.key_limits.iter().find(|c| c.name == name)
}

fn identity_config<'a>(ctx: &'a KeyContext, name: &str) -> Option<&'a RateLimitConfig> {
    ctx.identity_limits.iter().find(|c| c.name == name)
}

fn from_config(
    config: &RateLimitConfig,
    cost: u64,
    source: LimitSource,
) -> Result<ResolvedLimit, ValidationError> {
    if config.duration_ms == 0 {
        return Err(ValidationError::InvalidDuration {
            name: config.name.clone(),
            duration: 0,
        });
    }

    Ok(ResolvedLimit {
        identifier: Identifier::new(config.id.clone(), config.name.clone()),
        name: config.name.clone(),
        limit: config.limit,
        duration_ms: config.duration_ms,
        cost,
        auto_apply: config.auto_apply,
        source,
    })
}

fn parse_cost(request: &LimitRequest) -> Result<u64, ValidationError> {
    match request.cost {
        None => Ok(DEFAULT_COST),
        Some(cost) if cost < 0 => Err(ValidationError::NegativeCost {
            name: request.name.clone(),
            cost,
        }),
        Some(cost) => Ok(cost as u64),
    }
}

fn parse_limit(name: &str, limit: i64) -> Result<u32, ValidationError> {
    u32::try_from(limit).map_err(|_| ValidationError::InvalidLimit {
        name: name.to_string(),
        limit,
    })
}

fn parse_duration(name: &str, duration: i64) -> Result<u64, ValidationError> {
    if duration <= 0 {
        return Err(ValidationError::InvalidDuration {
            name: name.to_string(),
            duration,
        });
    }
    Ok(duration as u64)
}
