//! Request interception chain. Two layers, composed outer-to-inner exactly
//! in this order: rate limiting runs first and is the only one that may
//! short-circuit before the inner handler's timer starts; the timing
//! layer wraps only the inner handler, so a rejected request's latency
//! never pollutes `payments_request_duration_seconds`.

pub mod rate_limit;
pub mod timing;
