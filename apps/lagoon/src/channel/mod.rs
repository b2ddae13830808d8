//! Push-channel lifecycle: scoped subscriptions, reconnect replay, and
//! advisory checking of outbound events.

pub mod adapter;
pub mod contract;

pub use adapter::{ChannelAdapter, ChannelFault, ErrorHandler, SubscriptionGuard, SubscriptionSpec};
pub use contract::{ContractViolation, validate};
