// External market-data providers
pub mod dexscreener;

pub use dexscreener::{MarketDataClient, ProviderError, ProviderFilters};
