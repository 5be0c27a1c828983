//! Dual-channel ingestion: a REST client for periodic batch snapshots and
//! a persistent stream client for trade/book pushes, per spec §4.1/§4.2.

pub mod auth;
pub mod registry;
pub mod rest;
pub mod stream;
pub mod token_bucket;

pub use auth::TokenManager;
pub use registry::{Channel, Subscription, SubscriptionRegistry};
pub use rest::{BrokerRestClient, OrderBookDepth, QuoteSnapshot, RestClientConfig};
pub use stream::{BrokerStreamClient, BookFrame, Frame, SessionState, StreamClientConfig, TradeFrame, TungsteniteTransport, WireTransport};
pub use token_bucket::TokenBucket;
