//! DNS: the answer cache for intercepted port-53 flows.

pub mod cache;

pub use cache::{DnsAnswerCache, DnsCacheStats, DnsCacheStatsSnapshot};
