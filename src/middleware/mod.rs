// =============================================================================
// HTTP middleware
// =============================================================================

pub mod rate_limit;
