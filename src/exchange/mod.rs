// =============================================================================
// ExchangeGateway (C1) — §4.1
// =============================================================================
//
// A thin signer: per §9's "thread-local credential carrying" re-architecture
// point, the gateway holds no per-user state. Every signed call takes
// `&ExchangeCredentials` explicitly, constructed per-task by the caller
// (BroadcastDispatcher, the single-user HTTP path) rather than stashed in
// process-wide mutable state.
// =============================================================================

pub mod client;
pub mod rate_limit;
pub mod user_stream;

pub use client::{ExchangeApi, ExchangeGateway, OrderAck, OrderInfo, OrderSide, OrderType, SymbolInfo};
pub use user_stream::{OrderTradeUpdate, OrderTradeUpdateStatus, UserDataEvent, UserDataStream};
