pub mod adapters;
pub mod api;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod shutdown;
pub mod signals;

pub use adapters::{BinanceClient, SqliteStore, UserDataStream};
pub use config::AppConfig;
pub use engine::{EventSink, TradeEngine};
pub use error::{CortoError, Result};
pub use signals::SignalWatcher;
