use std::{
	fs,
	path::Path,
	sync::mpsc,
	time::{Duration, Instant},
};

use fs_notifier::{ChangeKind, Notification, Watcher, WatcherOptions};
use tempfile::tempdir;
use tracing_test::traced_test;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn start_watcher() -> (Watcher, mpsc::Receiver<Notification>) {
	let (tx, rx) = mpsc::channel();
	let watcher = Watcher::start(
		move |notification| {
			let _ = tx.send(notification);
		},
		WatcherOptions::default(),
	)
	.expect("Failed to start watcher");
	(watcher, rx)
}

/// Receives notifications until one matches or the timeout elapses,
/// panicking with everything seen so far on failure
fn expect_change(
	rx: &mpsc::Receiver<Notification>,
	expected_kind: ChangeKind,
	expected_path: &Path,
) {
	let deadline = Instant::now() + EVENT_TIMEOUT;
	let mut seen = Vec::new();
	loop {
		let remaining = deadline
			.checked_duration_since(Instant::now())
			.unwrap_or_else(|| {
				panic!("No ({expected_kind}, {expected_path:?}) notification, saw: {seen:#?}")
			});
		match rx.recv_timeout(remaining) {
			Ok(Notification::Change { kind, path })
				if kind == expected_kind && path == expected_path =>
			{
				return;
			}
			Ok(other) => seen.push(other),
			Err(_) => {
				panic!("No ({expected_kind}, {expected_path:?}) notification, saw: {seen:#?}")
			}
		}
	}
}

/// Like [`expect_change`] but only matches on the path; macOS coalesces
/// flags aggressively enough that the kind of a fresh file's first event
/// depends on timing
fn expect_change_for_path(rx: &mpsc::Receiver<Notification>, expected_path: &Path) {
	let deadline = Instant::now() + EVENT_TIMEOUT;
	let mut seen = Vec::new();
	loop {
		let remaining = deadline
			.checked_duration_since(Instant::now())
			.unwrap_or_else(|| panic!("No notification for {expected_path:?}, saw: {seen:#?}"));
		match rx.recv_timeout(remaining) {
			Ok(Notification::Change { path, .. }) if path == expected_path => return,
			Ok(other) => seen.push(other),
			Err(_) => panic!("No notification for {expected_path:?}, saw: {seen:#?}"),
		}
	}
}

fn expect_silence(rx: &mpsc::Receiver<Notification>) {
	if let Ok(notification) = rx.recv_timeout(Duration::from_millis(500)) {
		panic!("Expected no notifications, received {notification:?}");
	}
}

#[cfg(any(target_os = "linux", target_os = "windows"))]
#[test]
#[traced_test]
fn file_creation_is_reported_as_created() {
	let dir = tempdir().unwrap();
	let root = dir.path().canonicalize().unwrap();
	let (watcher, rx) = start_watcher();

	watcher
		.register_paths(vec![root.clone()])
		.expect("Failed to register path");

	let file_path = root.join("x.txt");
	fs::write(&file_path, b"hello").unwrap();

	expect_change(&rx, ChangeKind::Created, &file_path);
}

#[test]
#[traced_test]
fn file_write_is_reported_as_modified() {
	let dir = tempdir().unwrap();
	let root = dir.path().canonicalize().unwrap();
	let file_path = root.join("x.txt");
	fs::write(&file_path, b"hello").unwrap();

	let (watcher, rx) = start_watcher();
	watcher
		.register_paths(vec![root.clone()])
		.expect("Failed to register path");

	fs::write(&file_path, b"hello again").unwrap();

	expect_change(&rx, ChangeKind::Modified, &file_path);
}

#[cfg(any(target_os = "linux", target_os = "windows"))]
#[test]
#[traced_test]
fn rename_is_reported_as_removed_then_created() {
	let dir = tempdir().unwrap();
	let root = dir.path().canonicalize().unwrap();
	let old_path = root.join("x.txt");
	fs::write(&old_path, b"hello").unwrap();

	let (watcher, rx) = start_watcher();
	watcher
		.register_paths(vec![root.clone()])
		.expect("Failed to register path");

	let new_path = root.join("y.txt");
	fs::rename(&old_path, &new_path).unwrap();

	expect_change(&rx, ChangeKind::Removed, &old_path);
	expect_change(&rx, ChangeKind::Created, &new_path);
}

#[test]
#[traced_test]
fn no_events_are_delivered_before_registration() {
	let dir = tempdir().unwrap();
	let root = dir.path().canonicalize().unwrap();
	let (watcher, rx) = start_watcher();

	fs::write(root.join("before.txt"), b"unwatched").unwrap();
	expect_silence(&rx);

	// Registration still works afterwards
	watcher
		.register_paths(vec![root.clone()])
		.expect("Failed to register path");
	let file_path = root.join("after.txt");
	fs::write(&file_path, b"watched").unwrap();
	expect_change_for_path(&rx, &file_path);
}

#[test]
#[traced_test]
fn unregistered_path_goes_quiet() {
	let dir = tempdir().unwrap();
	let root = dir.path().canonicalize().unwrap();
	let (watcher, rx) = start_watcher();

	watcher
		.register_paths(vec![root.clone()])
		.expect("Failed to register path");
	let file_path = root.join("x.txt");
	fs::write(&file_path, b"hello").unwrap();
	expect_change_for_path(&rx, &file_path);

	assert!(watcher.unregister_paths(vec![root.clone()]).unwrap());
	while rx.try_recv().is_ok() {}

	fs::write(root.join("quiet.txt"), b"nobody listening").unwrap();
	expect_silence(&rx);
}

// Deleting the watched root itself invalidates the watch point; the exact
// signal differs per platform kernel, so the strict assertions are gated
#[cfg(target_os = "linux")]
#[test]
#[traced_test]
fn deleting_the_root_invalidates_it_and_unregister_still_reports_it() {
	let dir = tempdir().unwrap();
	let root = dir.path().join("watched");
	fs::create_dir(&root).unwrap();

	let (watcher, rx) = start_watcher();
	watcher
		.register_paths(vec![root.clone()])
		.expect("Failed to register path");

	fs::remove_dir(&root).unwrap();
	expect_change(&rx, ChangeKind::Invalidated, &root);

	// The path was registered, so unregistering it still reports success
	assert!(watcher.unregister_paths(vec![root.clone()]).unwrap());

	// And it can be watched again once the directory is recreated
	fs::create_dir(&root).unwrap();
	watcher
		.register_paths(vec![root.clone()])
		.expect("Failed to re-register path");
}

#[cfg(target_os = "linux")]
#[test]
#[traced_test]
fn events_inside_a_deleted_root_stop_after_invalidation() {
	let dir = tempdir().unwrap();
	let root = dir.path().join("watched");
	fs::create_dir(&root).unwrap();

	let (watcher, rx) = start_watcher();
	watcher
		.register_paths(vec![root.clone()])
		.expect("Failed to register path");

	fs::remove_dir(&root).unwrap();
	expect_change(&rx, ChangeKind::Invalidated, &root);

	// Without re-registration, recreating the directory produces nothing
	fs::create_dir(&root).unwrap();
	fs::write(root.join("x.txt"), b"hello").unwrap();
	expect_silence(&rx);
}
