pub mod watcher;

pub use watcher::SignalWatcher;
