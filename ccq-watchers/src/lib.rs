//! Per-chain watchers and the worker pools that drive them.
mod dummy;
mod pool;
mod task;
mod watcher;

pub use dummy::DummyWatcher;
pub use pool::WatcherPool;
pub use task::CancelSignal;
pub use task::WatcherTask;
pub use watcher::ChainWatcher;
pub use watcher::WatcherError;
