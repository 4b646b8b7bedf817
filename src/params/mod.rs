pub mod cache;
pub mod watcher;

pub use cache::{ParamCache, ParamValue};
pub use watcher::{ParamWatcher, WatchKey};
