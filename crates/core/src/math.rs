//! Progress arithmetic.
//!
//! Every percentage shown for a pack is produced here. Call sites must not
//! inline their own division: the guards against zero/NaN denominators and
//! the 99% cap live in one place so two ingestors can never disagree about
//! what "3 of 4 items" looks like.

/// Weight of an item that is fully active.
pub const ACTIVE_WEIGHT: u64 = 100;

/// Weight of an item whose transfer finished but which is not active yet.
pub const PENDING_WEIGHT: u64 = 95;

/// Highest value allowed before every item is confirmed active.
pub const PRE_COMPLETION_CAP: u32 = 99;

/// Divide, falling back when the inputs or the result are not usable.
///
/// Returns `fallback` when `denominator` is zero, NaN or infinite, when
/// `numerator` is NaN, or when the quotient itself is not finite.
pub fn safe_div(numerator: f64, denominator: f64, fallback: f64) -> f64 {
    if numerator.is_nan() || !denominator.is_finite() || denominator == 0.0 {
        return fallback;
    }
    let result = numerator / denominator;
    if result.is_finite() {
        result
    } else {
        fallback
    }
}

/// `floor(completed * 100 / total)`, clamped into `[0, 100]`.
pub fn safe_percentage(completed: f64, total: f64, fallback: f64) -> f64 {
    let raw = safe_div(completed * 100.0, total, fallback).floor();
    if raw.is_nan() {
        return 0.0;
    }
    raw.clamp(0.0, 100.0)
}

/// Weighted completion of a pack.
///
/// Active items count fully, pending items count 95%. 100 is reserved for
/// the state where every item is active: a raw result of 100 or more with
/// `active < total` is capped at 99.
pub fn weighted_progress(active: u32, pending: u32, total: u32) -> u32 {
    let numerator = u64::from(active) * ACTIVE_WEIGHT + u64::from(pending) * PENDING_WEIGHT;
    let raw = safe_div(numerator as f64, f64::from(total), 0.0).floor();
    let raw = if raw.is_finite() && raw > 0.0 { raw } else { 0.0 };

    if raw >= 100.0 {
        if active < total {
            PRE_COMPLETION_CAP
        } else {
            100
        }
    } else {
        raw as u32
    }
}

/// Transfer percentage of one file; 0 when the total size is unknown.
pub fn transfer_percent(bytes_so_far: f64, bytes_total: f64) -> f64 {
    if !(bytes_total > 0.0) {
        return 0.0;
    }
    safe_percentage(bytes_so_far, bytes_total, 0.0)
}
