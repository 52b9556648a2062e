//! Cross-platform filesystem change notifier
//!
//! `fs-notifier` watches a caller-supplied set of directory subtrees and
//! streams canonicalized change events to a callback, hiding the differences
//! between the native notification primitives of each platform: FSEvents on
//! macOS, `ReadDirectoryChangesW` on Windows and inotify on Linux.
//!
//! # Architecture
//!
//! Every [`Watcher`] owns a single background worker thread. All kernel
//! handles and watch-point bookkeeping are owned exclusively by that thread;
//! foreign threads interact with it only through a serialized command queue
//! (register, unregister, terminate) and through the outbound
//! [`EventHandler`] callback, which is invoked on the worker thread.
//!
//! Raw OS events are normalized to the five canonical [`ChangeKind`]s. Event
//! loss reported by the kernel is surfaced as an out-of-band overflow
//! notification carrying the affected root; the caller is expected to rescan
//! that subtree.
//!
//! # Example
//!
//! ```ignore
//! use fs_notifier::{Notification, Watcher, WatcherOptions};
//!
//! let watcher = Watcher::start(
//! 	|notification| match notification {
//! 		Notification::Change { kind, path } => println!("{kind}: {}", path.display()),
//! 		Notification::Overflow { root } => println!("rescan {}", root.display()),
//! 		Notification::Error(e) => eprintln!("watcher error: {e}"),
//! 	},
//! 	WatcherOptions::default(),
//! )?;
//!
//! watcher.register_paths(vec!["/some/absolute/path".into()])?;
//! ```

mod command;
mod config;
mod error;
mod event;
mod path;
mod platform;
mod watcher;

pub use config::WatcherOptions;
pub use error::{Result, WatcherError};
pub use event::{ChangeKind, EventHandler, Notification};
pub use watcher::Watcher;
