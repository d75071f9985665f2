pub mod market_stream;
pub mod rest;
pub mod user_stream;

pub use market_stream::MarketStream;
pub use rest::BinanceClient;
pub use user_stream::UserStream;
