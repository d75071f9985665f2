pub mod binance;
pub mod gateway;

pub use binance::{BinanceClient, MarketStream, UserStream};
pub use gateway::{Gateway, RetryPolicy};
