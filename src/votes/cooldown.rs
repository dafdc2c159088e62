use serde::Serialize;

use crate::votes::VoteChangeRecord;

pub const BASE_COOLDOWN_SECS: i64 = 72 * 60;
pub const COOLDOWN_MULTIPLIER: u32 = 2;
pub const MAX_COOLDOWN_SECS: i64 = 8 * 60 * 60;
pub const RESET_WINDOW_SECS: i64 = 24 * 60 * 60;
pub const FREQUENT_CHANGE_THRESHOLD: u32 = 2;

/// Outcome of a single cooldown evaluation: whether the change may happen
/// now, and the cooldown the change will serve if it does.
#[derive(Debug, Clone)]
pub struct CooldownDecision {
    pub allowed: bool,
    /// Human-readable rejection reason when not allowed.
    pub message: Option<String>,
    /// Epoch second at which voting resumes, when not allowed.
    pub resume_at: Option<i64>,
    /// The change_count this change will carry when recorded.
    pub next_change_count: u32,
    /// The cooldown duration this change will serve.
    pub next_duration_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CooldownStatus {
    pub active: bool,
    pub remaining_secs: i64,
    pub change_count: u32,
    pub next_change_duration_secs: i64,
}

/// Cooldown served by a change that becomes the voter's `change_count`-th
/// within the reset window: base doubles past the threshold, clamped to
/// [base, cap].
pub fn duration_for_change(change_count: u32) -> i64 {
    let exponent = (change_count + 1).saturating_sub(FREQUENT_CHANGE_THRESHOLD);
    let factor = (COOLDOWN_MULTIPLIER as i64).saturating_pow(exponent);
    (BASE_COOLDOWN_SECS.saturating_mul(factor)).clamp(BASE_COOLDOWN_SECS, MAX_COOLDOWN_SECS)
}

/// Number of recent changes still counting against the voter.
pub fn effective_count(latest: Option<&VoteChangeRecord>, now: i64) -> u32 {
    match latest {
        Some(record) if now - record.change_timestamp <= RESET_WINDOW_SECS => record.change_count,
        _ => 0,
    }
}

/// Decide whether a vote change may happen at `now`.
///
/// `has_current_vote` and `same_pools` come from the caller's read of the
/// current vote; a first vote or a no-op resubmission is always admitted.
pub fn evaluate(
    latest: Option<&VoteChangeRecord>,
    has_current_vote: bool,
    same_pools: bool,
    now: i64,
) -> CooldownDecision {
    if !has_current_vote || same_pools {
        return CooldownDecision {
            allowed: true,
            message: None,
            resume_at: None,
            next_change_count: 1,
            next_duration_secs: BASE_COOLDOWN_SECS,
        };
    }

    if let Some(record) = latest {
        if record.cooldown_until > now {
            let remaining = record.cooldown_until - now;
            return CooldownDecision {
                allowed: false,
                message: Some(format!(
                    "Vote change cooldown active. You can change your vote in {} more minutes",
                    remaining / 60
                )),
                resume_at: Some(record.cooldown_until),
                next_change_count: record.change_count,
                next_duration_secs: duration_for_change(record.change_count),
            };
        }
    }

    let count = effective_count(latest, now) + 1;
    CooldownDecision {
        allowed: true,
        message: None,
        resume_at: None,
        next_change_count: count,
        next_duration_secs: duration_for_change(count),
    }
}

/// Cooldown state reported on `/voteCooldown/:voter`.
pub fn status_for(latest: Option<&VoteChangeRecord>, now: i64) -> CooldownStatus {
    let (active, remaining) = match latest {
        Some(record) if record.cooldown_until > now => (true, record.cooldown_until - now),
        _ => (false, 0),
    };
    let count = effective_count(latest, now);
    CooldownStatus {
        active,
        remaining_secs: remaining,
        change_count: count,
        next_change_duration_secs: duration_for_change(count + 1),
    }
}
