//! Windows engine: one directory handle per watch point driving overlapped
//! `ReadDirectoryChangesW` with a completion routine.
//!
//! The worker spends its idle time in an alertable `SleepEx`; commands are
//! delivered as user APCs and event completions run through the same
//! alertable mechanism, so everything executes on the worker thread. Watch
//! points are boxed so the kernel-visible `OVERLAPPED` block (whose user
//! slot points back at the watch point) never moves while a read is
//! pending.

use std::{
	collections::HashMap,
	ffi::c_void,
	mem,
	path::{Path, PathBuf},
	ptr, slice,
	sync::Arc,
};

use tracing::{debug, error, trace, warn};
use windows_sys::Win32::{
	Foundation::{
		CloseHandle, DuplicateHandle, GetLastError, DUPLICATE_SAME_ACCESS, ERROR_ACCESS_DENIED,
		ERROR_NOT_FOUND, ERROR_OPERATION_ABORTED, ERROR_SUCCESS, HANDLE, INVALID_HANDLE_VALUE,
	},
	Storage::FileSystem::{
		CreateFileW, GetFileAttributesW, ReadDirectoryChangesW, FILE_ACTION_ADDED,
		FILE_ACTION_MODIFIED, FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME,
		FILE_ACTION_RENAMED_OLD_NAME, FILE_ATTRIBUTE_DIRECTORY, FILE_FLAG_BACKUP_SEMANTICS,
		FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY, FILE_NOTIFY_CHANGE_ATTRIBUTES,
		FILE_NOTIFY_CHANGE_CREATION, FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME,
		FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SECURITY, FILE_NOTIFY_CHANGE_SIZE,
		FILE_NOTIFY_INFORMATION, FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE,
		INVALID_FILE_ATTRIBUTES, OPEN_EXISTING,
	},
	System::{
		Threading::{
			GetCurrentProcess, GetCurrentThread, QueueUserAPC, SetThreadPriority, SleepEx,
			INFINITE, THREAD_PRIORITY_ABOVE_NORMAL,
		},
		IO::{CancelIoEx, OVERLAPPED},
	},
};

use crate::{
	command::{Command, CommandOutcome, CommandQueue},
	config::WatcherOptions,
	error::{Result, WatcherError},
	event::{ChangeKind, EventHandler},
	path::{to_long_path, to_user_path, to_wide_nul},
	platform::{StartupSender, Waker, WatchPointStatus},
};

/// Sized for typical burst activity; a full buffer means the kernel dropped
/// changes and the root must be rescanned
const EVENT_BUFFER_SIZE: usize = 64 * 1024;

const CREATE_SHARE: u32 = FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE;
const CREATE_FLAGS: u32 = FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED;
const EVENT_MASK: u32 = FILE_NOTIFY_CHANGE_FILE_NAME
	| FILE_NOTIFY_CHANGE_DIR_NAME
	| FILE_NOTIFY_CHANGE_ATTRIBUTES
	| FILE_NOTIFY_CHANGE_SIZE
	| FILE_NOTIFY_CHANGE_LAST_WRITE
	| FILE_NOTIFY_CHANGE_CREATION
	| FILE_NOTIFY_CHANGE_SECURITY;

enum ListenResult {
	Success,
	/// The root stopped being a directory before the read could be armed
	Deleted,
}

struct WatchPoint {
	/// Canonical (extended-length) form handed to the kernel
	path: String,
	status: WatchPointStatus,
	directory_handle: HANDLE,
	handle_closed: bool,
	buffer: Vec<u8>,
	/// The kernel holds a pointer to this block while a read is pending;
	/// its user slot points back at the owning watch point
	overlapped: OVERLAPPED,
	/// Back pointer to the engine, type-erased so the watch point itself
	/// stays non-generic
	engine: *mut c_void,
}

impl WatchPoint {
	fn new<H: EventHandler>(engine: *mut c_void, path: String) -> Result<Box<Self>> {
		let wide_path = to_wide_nul(&path);
		let directory_handle = unsafe {
			CreateFileW(
				wide_path.as_ptr(),
				FILE_LIST_DIRECTORY,
				CREATE_SHARE,
				ptr::null(),
				OPEN_EXISTING,
				CREATE_FLAGS,
				ptr::null_mut(),
			)
		};
		if directory_handle == INVALID_HANDLE_VALUE {
			return Err(WatcherError::os(
				"Couldn't add watch",
				Some(PathBuf::from(to_user_path(&path))),
				unsafe { GetLastError() } as i32,
			));
		}

		let mut point = Box::new(Self {
			path,
			status: WatchPointStatus::NotListening,
			directory_handle,
			handle_closed: false,
			buffer: vec![0u8; EVENT_BUFFER_SIZE],
			overlapped: unsafe { mem::zeroed() },
			engine,
		});
		point.overlapped.hEvent = (&mut *point as *mut Self).cast();

		match point.listen::<H>()? {
			ListenResult::Success => Ok(point),
			ListenResult::Deleted => Err(WatcherError::InvalidPath {
				path: PathBuf::from(to_user_path(&point.path)),
				source: std::io::Error::new(
					std::io::ErrorKind::InvalidInput,
					"not a directory",
				),
			}),
		}
	}

	/// Arms the next overlapped read
	fn listen<H: EventHandler>(&mut self) -> Result<ListenResult> {
		let success = unsafe {
			ReadDirectoryChangesW(
				self.directory_handle,
				self.buffer.as_mut_ptr().cast(),
				EVENT_BUFFER_SIZE as u32,
				1,
				EVENT_MASK,
				ptr::null_mut(),
				&mut self.overlapped,
				Some(handle_event_callback::<H>),
			)
		};
		if success != 0 {
			self.status = WatchPointStatus::Listening;
			Ok(ListenResult::Success)
		} else {
			self.status = WatchPointStatus::Finished;
			let last_error = unsafe { GetLastError() };
			if last_error == ERROR_ACCESS_DENIED && !self.is_valid_directory() {
				Ok(ListenResult::Deleted)
			} else {
				Err(WatcherError::os(
					"Couldn't start watching",
					Some(PathBuf::from(to_user_path(&self.path))),
					last_error as i32,
				))
			}
		}
	}

	fn is_valid_directory(&self) -> bool {
		let wide_path = to_wide_nul(&self.path);
		let attributes = unsafe { GetFileAttributesW(wide_path.as_ptr()) };
		attributes != INVALID_FILE_ATTRIBUTES && (attributes & FILE_ATTRIBUTE_DIRECTORY) != 0
	}

	/// Requests cancellation of the pending read. Returns `true` if the
	/// kernel accepted the cancel, in which case the completion routine
	/// still runs once with `ERROR_OPERATION_ABORTED` and must be given an
	/// alertable wait to do so.
	fn cancel(&mut self) -> Result<bool> {
		if self.status != WatchPointStatus::Listening {
			return Ok(false);
		}
		debug!("Cancelling {}", self.path);
		self.status = WatchPointStatus::Cancelled;
		let cancelled = unsafe { CancelIoEx(self.directory_handle, &self.overlapped) } != 0;
		if !cancelled {
			self.status = WatchPointStatus::Finished;
			let last_error = unsafe { GetLastError() };
			if last_error == ERROR_NOT_FOUND {
				// No outstanding I/O, the completion routine already ran
				trace!("Watch point already finished {}", self.path);
			} else {
				return Err(WatcherError::os(
					"Couldn't cancel watch point",
					Some(PathBuf::from(to_user_path(&self.path))),
					last_error as i32,
				));
			}
		}
		Ok(cancelled)
	}

	fn handle_completion<H: EventHandler>(&mut self, error_code: u32, bytes_transferred: u32) {
		if error_code == ERROR_OPERATION_ABORTED {
			debug!("Finished watching {}, status {:?}", self.path, self.status);
			self.close_handle();
			self.status = WatchPointStatus::Finished;
			return;
		}

		if self.status != WatchPointStatus::Listening {
			trace!(
				"Ignoring incoming events for {} as watch point is not listening ({bytes_transferred} bytes, status {:?})",
				self.path,
				self.status
			);
			return;
		}
		self.status = WatchPointStatus::NotListening;

		let engine = unsafe { &mut *self.engine.cast::<Engine<H>>() };
		engine.handle_events(self, error_code, bytes_transferred);
	}

	fn close_handle(&mut self) {
		if self.handle_closed {
			return;
		}
		if unsafe { CloseHandle(self.directory_handle) } == 0 {
			error!("Couldn't close handle for {}: {}", self.path, unsafe {
				GetLastError()
			});
		}
		self.handle_closed = true;
	}
}

impl Drop for WatchPoint {
	fn drop(&mut self) {
		match self.cancel() {
			// Let the aborted completion run against this watch point while
			// it is still alive
			Ok(true) => unsafe {
				SleepEx(0, 1);
			},
			Ok(false) => {}
			Err(e) => warn!("Couldn't cancel watch point {}: {e}", self.path),
		}
		self.close_handle();
	}
}

unsafe extern "system" fn handle_event_callback<H: EventHandler>(
	error_code: u32,
	bytes_transferred: u32,
	overlapped: *mut OVERLAPPED,
) {
	let watch_point = unsafe { &mut *(*overlapped).hEvent.cast::<WatchPoint>() };
	watch_point.handle_completion::<H>(error_code, bytes_transferred);
}

unsafe extern "system" fn drain_commands_callback<H: EventHandler>(param: usize) {
	let engine = unsafe { &mut *(param as *mut Engine<H>) };
	engine.handle_commands();
}

/// Queues an APC that drains the command queue on the worker thread
struct ApcWaker {
	/// Real (duplicated) handle to the worker thread
	thread: usize,
	/// Engine address passed through the APC parameter
	engine: usize,
	apc: unsafe extern "system" fn(usize),
}

impl Waker for ApcWaker {
	fn wake(&self) -> Result<()> {
		let queued =
			unsafe { QueueUserAPC(Some(self.apc), self.thread as HANDLE, self.engine) };
		if queued == 0 {
			return Err(WatcherError::os(
				"Couldn't queue command wake-up to worker thread",
				None,
				unsafe { GetLastError() } as i32,
			));
		}
		Ok(())
	}
}

impl Drop for ApcWaker {
	fn drop(&mut self) {
		unsafe { CloseHandle(self.thread as HANDLE) };
	}
}

struct Engine<H> {
	queue: Arc<CommandQueue>,
	handler: H,
	watch_points: HashMap<String, Box<WatchPoint>>,
	terminated: bool,
}

pub(crate) fn run<H: EventHandler>(
	queue: Arc<CommandQueue>,
	handler: H,
	_options: WatcherOptions,
	started: StartupSender,
) {
	// Reduce event loss under load
	unsafe { SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_ABOVE_NORMAL) };

	let mut engine = Box::new(Engine {
		queue: Arc::clone(&queue),
		handler,
		watch_points: HashMap::new(),
		terminated: false,
	});
	let engine_ptr: *mut Engine<H> = &mut *engine;

	// APCs need a real handle, not the pseudo-handle of the current thread
	let mut thread_handle: HANDLE = ptr::null_mut();
	let duplicated = unsafe {
		DuplicateHandle(
			GetCurrentProcess(),
			GetCurrentThread(),
			GetCurrentProcess(),
			&mut thread_handle,
			0,
			0,
			DUPLICATE_SAME_ACCESS,
		)
	};
	if duplicated == 0 {
		let _ = started.send(Err(WatcherError::os(
			"Couldn't duplicate worker thread handle",
			None,
			unsafe { GetLastError() } as i32,
		)));
		return;
	}

	let _ = started.send(Ok(Arc::new(ApcWaker {
		thread: thread_handle as usize,
		engine: engine_ptr as usize,
		apc: drain_commands_callback::<H>,
	})));

	while !engine.terminated {
		// Both command APCs and read completions run inside this call
		unsafe { SleepEx(INFINITE, 1) };
	}

	engine.cancel_all();
	queue.close();
	debug!("Watcher worker finished");
}

impl<H: EventHandler> Engine<H> {
	fn handle_commands(&mut self) {
		let queue = Arc::clone(&self.queue);
		queue.drain(|command| self.execute(command));
	}

	fn execute(&mut self, command: Command) -> Result<CommandOutcome> {
		if self.terminated && !matches!(command, Command::Terminate) {
			return Err(WatcherError::ShuttingDown);
		}
		match command {
			Command::Register(paths) => {
				for path in paths {
					self.register_path(&path)?;
				}
				Ok(CommandOutcome::Done)
			}
			Command::Unregister(paths) => {
				let mut all_known = true;
				for path in paths {
					all_known &= self.unregister_path(&path);
				}
				Ok(CommandOutcome::Unregistered(all_known))
			}
			Command::Terminate => {
				debug!("Terminating watcher worker");
				self.terminated = true;
				Ok(CommandOutcome::Done)
			}
		}
	}

	fn register_path(&mut self, path: &Path) -> Result<()> {
		let long_path = to_long_path(&path.to_string_lossy());
		if let Some(existing) = self.watch_points.get(&long_path) {
			if existing.status != WatchPointStatus::Finished {
				return Err(WatcherError::AlreadyWatched(path.to_owned()));
			}
			// The old subscription already died (root deleted or buffer
			// overflowed); evict it before re-arming
			self.watch_points.remove(&long_path);
		}

		let point = WatchPoint::new::<H>((self as *mut Self).cast(), long_path.clone())?;
		debug!("Now watching {long_path}");
		self.watch_points.insert(long_path, point);
		Ok(())
	}

	fn unregister_path(&mut self, path: &Path) -> bool {
		let long_path = to_long_path(&path.to_string_lossy());
		let Some(point) = self.watch_points.remove(&long_path) else {
			debug!("Path is not watched: {}", path.display());
			return false;
		};
		// Dropping the watch point cancels the pending read and waits one
		// alertable pass for the aborted completion
		drop(point);
		debug!("Stopped watching {long_path}");
		true
	}

	fn handle_events(&mut self, watch_point: &mut WatchPoint, error_code: u32, bytes_transferred: u32) {
		let root = watch_point.path.clone();

		if error_code != ERROR_SUCCESS {
			if error_code == ERROR_ACCESS_DENIED && !watch_point.is_valid_directory() {
				watch_point.status = WatchPointStatus::Finished;
				self.handler
					.handle_change(ChangeKind::Removed, PathBuf::from(to_user_path(&root)));
			} else {
				self.handler.handle_error(WatcherError::os(
					"Error received when handling events",
					Some(PathBuf::from(to_user_path(&root))),
					error_code as i32,
				));
			}
			return;
		}

		if self.terminated {
			debug!(
				"Ignoring incoming events for {root} because watcher is terminating ({bytes_transferred} bytes)"
			);
			return;
		}

		if bytes_transferred == 0 {
			// Buffer overflowed, the current changes are lost
			warn!("Detected overflow for {root}");
			watch_point.status = WatchPointStatus::Finished;
			self.handler
				.handle_change(ChangeKind::Invalidated, PathBuf::from(to_user_path(&root)));
			return;
		}

		let buffer = &watch_point.buffer[..bytes_transferred as usize];
		let mut offset = 0usize;
		loop {
			let info =
				unsafe { &*buffer.as_ptr().add(offset).cast::<FILE_NOTIFY_INFORMATION>() };
			self.handle_event(&root, info);
			if info.NextEntryOffset == 0 {
				break;
			}
			offset += info.NextEntryOffset as usize;
		}

		match watch_point.listen::<H>() {
			Ok(ListenResult::Success) => {}
			Ok(ListenResult::Deleted) => {
				self.handler
					.handle_change(ChangeKind::Removed, PathBuf::from(to_user_path(&root)));
			}
			Err(e) => self.handler.handle_error(e),
		}
	}

	fn handle_event(&mut self, root: &str, info: &FILE_NOTIFY_INFORMATION) {
		let name_len = info.FileNameLength as usize / mem::size_of::<u16>();
		let name = unsafe { slice::from_raw_parts(info.FileName.as_ptr(), name_len) };

		let mut changed_path = root.to_owned();
		if !name.is_empty() {
			changed_path.push('\\');
			changed_path.push_str(&String::from_utf16_lossy(name));
		}
		// Callers only ever see the paths they registered, never the
		// extended-length form
		let changed_path = to_user_path(&changed_path);

		let kind = change_kind_for_action(info.Action);
		if kind == ChangeKind::Unknown {
			warn!("Unknown event {:#x} for {changed_path}", info.Action);
		}
		trace!("Event {kind} for {changed_path}");
		self.handler.handle_change(kind, PathBuf::from(changed_path));
	}

	/// Issues cancels for everything still live and gives the completions
	/// one alertable pass to acknowledge; called on the way out of the run
	/// loop
	fn cancel_all(&mut self) {
		debug!("Finished with run loop, now cancelling remaining watch points");
		let mut pending = 0;
		for point in self.watch_points.values_mut() {
			match point.status {
				WatchPointStatus::Listening => match point.cancel() {
					Ok(true) => pending += 1,
					Ok(false) => {}
					Err(e) => error!("{e}"),
				},
				WatchPointStatus::Cancelled => pending += 1,
				_ => {}
			}
		}

		if pending > 0 {
			debug!("Waiting for {pending} pending watch points to finish");
			unsafe { SleepEx(0, 1) };
		}

		for point in self.watch_points.values() {
			match point.status {
				WatchPointStatus::NotListening | WatchPointStatus::Finished => {}
				status => warn!(
					"Watch point {} did not finish before termination (status {status:?})",
					point.path
				),
			}
		}
	}
}

fn change_kind_for_action(action: u32) -> ChangeKind {
	match action {
		FILE_ACTION_ADDED | FILE_ACTION_RENAMED_NEW_NAME => ChangeKind::Created,
		FILE_ACTION_REMOVED | FILE_ACTION_RENAMED_OLD_NAME => ChangeKind::Removed,
		FILE_ACTION_MODIFIED => ChangeKind::Modified,
		_ => ChangeKind::Unknown,
	}
}
