use std::{sync::mpsc, time::Duration};

use fs_notifier::{Notification, Watcher, WatcherError, WatcherOptions};
use tempfile::tempdir;

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

#[test]
fn register_then_unregister_round_trips() {
	let dir = tempdir().unwrap();
	let (watcher, _rx) = start_watcher();

	watcher
		.register_paths(vec![dir.path().to_path_buf()])
		.expect("Failed to register path");
	assert!(watcher
		.unregister_paths(vec![dir.path().to_path_buf()])
		.unwrap());
}

#[test]
fn double_register_fails_and_keeps_first_registration() {
	let dir = tempdir().unwrap();
	let (watcher, _rx) = start_watcher();

	watcher
		.register_paths(vec![dir.path().to_path_buf()])
		.expect("Failed to register path");

	let second = watcher.register_paths(vec![dir.path().to_path_buf()]);
	assert!(
		matches!(second, Err(WatcherError::AlreadyWatched(ref path)) if path == dir.path()),
		"expected AlreadyWatched, got {second:?}"
	);

	// The first registration must still be live
	assert!(watcher
		.unregister_paths(vec![dir.path().to_path_buf()])
		.unwrap());
}

#[test]
fn successfully_registered_paths_in_a_failing_batch_stay_watched() {
	let dir_a = tempdir().unwrap();
	let dir_b = tempdir().unwrap();
	let (watcher, _rx) = start_watcher();

	watcher
		.register_paths(vec![dir_b.path().to_path_buf()])
		.expect("Failed to register path");

	// dir_a succeeds, dir_b fails with AlreadyWatched
	let result = watcher.register_paths(vec![
		dir_a.path().to_path_buf(),
		dir_b.path().to_path_buf(),
	]);
	assert!(matches!(result, Err(WatcherError::AlreadyWatched(_))));

	// Both paths are watched now: dir_a from the failing batch, dir_b from
	// before
	assert!(watcher
		.unregister_paths(vec![dir_a.path().to_path_buf(), dir_b.path().to_path_buf()])
		.unwrap());
}

#[test]
fn unregister_of_unknown_path_returns_false_but_unregisters_the_rest() {
	let known = tempdir().unwrap();
	let unknown = tempdir().unwrap();
	let (watcher, _rx) = start_watcher();

	watcher
		.register_paths(vec![known.path().to_path_buf()])
		.expect("Failed to register path");

	assert!(!watcher
		.unregister_paths(vec![
			unknown.path().to_path_buf(),
			known.path().to_path_buf()
		])
		.unwrap());

	// The known path really was unregistered by the mixed batch
	watcher
		.register_paths(vec![known.path().to_path_buf()])
		.expect("Path should be registrable again");
}

#[test]
fn registering_a_missing_path_fails_and_leaves_the_watcher_usable() {
	let dir = tempdir().unwrap();
	let missing = dir.path().join("does-not-exist");
	let (watcher, _rx) = start_watcher();

	let result = watcher.register_paths(vec![missing]);
	assert!(
		matches!(
			result,
			Err(WatcherError::InvalidPath { .. }) | Err(WatcherError::Os { .. })
		),
		"expected a registration failure, got {result:?}"
	);

	watcher
		.register_paths(vec![dir.path().to_path_buf()])
		.expect("Watcher should still accept valid paths");
}

#[test]
fn terminate_is_idempotent() {
	let (mut watcher, _rx) = start_watcher();
	watcher.terminate().expect("First terminate failed");
	watcher.terminate().expect("Second terminate failed");
}

#[test]
fn commands_after_terminate_fail_with_shutting_down() {
	let dir = tempdir().unwrap();
	let (mut watcher, _rx) = start_watcher();
	watcher.terminate().unwrap();

	assert!(matches!(
		watcher.register_paths(vec![dir.path().to_path_buf()]),
		Err(WatcherError::ShuttingDown)
	));
	assert!(matches!(
		watcher.unregister_paths(vec![dir.path().to_path_buf()]),
		Err(WatcherError::ShuttingDown)
	));
}

#[test]
fn no_notifications_after_terminate_returns() {
	let dir = tempdir().unwrap();
	let (mut watcher, rx) = start_watcher();

	watcher
		.register_paths(vec![dir.path().to_path_buf()])
		.expect("Failed to register path");
	watcher.terminate().expect("Failed to terminate");

	// Drop anything that arrived before termination completed
	while rx.try_recv().is_ok() {}

	std::fs::write(dir.path().join("after.txt"), b"too late").unwrap();
	assert!(
		rx.recv_timeout(Duration::from_millis(500)).is_err(),
		"received a notification after terminate returned"
	);
}

#[test]
fn dropping_the_watcher_stops_the_worker() {
	let dir = tempdir().unwrap();
	let (watcher, rx) = start_watcher();

	watcher
		.register_paths(vec![dir.path().to_path_buf()])
		.expect("Failed to register path");
	drop(watcher);

	while rx.try_recv().is_ok() {}
	std::fs::write(dir.path().join("after-drop.txt"), b"too late").unwrap();
	assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
}
