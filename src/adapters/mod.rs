pub mod binance_rest;
pub mod store;
pub mod user_stream;

pub use binance_rest::{BinanceClient, OrderAck, OrderState, PositionInfo, SymbolFilters};
pub use store::{PnlSummary, SqliteStore};
pub use user_stream::{OrderUpdate, UserDataStream};
