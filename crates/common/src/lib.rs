pub mod config;
pub mod error;
pub mod exchange;
pub mod precision;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use exchange::{ExchangeApi, OpenOrder, OrderAck, OrderRequest, OrderState};
pub use precision::SymbolFilters;
pub use types::*;
