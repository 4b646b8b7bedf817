pub mod dispatcher;
pub mod watcher;

pub use dispatcher::{callback_from_handler, EventCallback, EventDispatcher, EventHandler};
pub use watcher::{EventRecord, EventWatcher};
