//! Path canonicalization helpers for Windows long paths.
//!
//! Win32 directory APIs are limited to roughly 240 UTF-16 units unless the
//! path uses the extended-length `\\?\` form. Watch roots are converted to
//! that form before they reach the kernel, and the transform is undone on
//! every emitted event so callers only ever see the paths they registered.

#![cfg_attr(not(any(target_os = "windows", test)), allow(dead_code))]

/// Technically the Win32 limit is `MAX_PATH` (260), but some directory APIs
/// cap out around 240, so both cases are covered by one threshold.
const LONG_PATH_THRESHOLD: usize = 240;

const LONG_PATH_PREFIX: &str = r"\\?\";
const UNC_LONG_PATH_PREFIX: &str = r"\\?\UNC\";

fn is_absolute_local_path(path: &str) -> bool {
	let bytes = path.as_bytes();
	bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'\\'
}

fn is_absolute_unc_path(path: &str) -> bool {
	path.len() >= 3 && path.starts_with(r"\\")
}

/// Rewrites a path longer than the Win32 limit into its extended-length
/// form: `C:\...` becomes `\\?\C:\...` and `\\server\share\...` becomes
/// `\\?\UNC\server\share\...`. Short paths, already-long paths and paths in
/// an unrecognized format are returned unchanged.
pub(crate) fn to_long_path(path: &str) -> String {
	if path.encode_utf16().count() <= LONG_PATH_THRESHOLD {
		return path.to_owned();
	}
	if path.starts_with(LONG_PATH_PREFIX) {
		return path.to_owned();
	}
	if is_absolute_local_path(path) {
		format!("{LONG_PATH_PREFIX}{path}")
	} else if is_absolute_unc_path(path) {
		format!("{UNC_LONG_PATH_PREFIX}{}", &path[2..])
	} else {
		path.to_owned()
	}
}

/// Undoes [`to_long_path`] so emitted events carry the user-facing form
pub(crate) fn to_user_path(path: &str) -> String {
	if let Some(rest) = path.strip_prefix(UNC_LONG_PATH_PREFIX) {
		format!(r"\\{rest}")
	} else if let Some(rest) = path.strip_prefix(LONG_PATH_PREFIX) {
		rest.to_owned()
	} else {
		path.to_owned()
	}
}

/// Nul-terminated UTF-16 form expected by the wide Win32 entry points
#[cfg(target_os = "windows")]
pub(crate) fn to_wide_nul(path: &str) -> Vec<u16> {
	path.encode_utf16().chain(Some(0)).collect()
}

#[cfg(test)]
mod tests {
	use super::{to_long_path, to_user_path, LONG_PATH_THRESHOLD};

	fn local_path_of_len(len: usize) -> String {
		let mut path = String::from(r"C:\");
		while path.len() < len {
			path.push('a');
		}
		path
	}

	#[test]
	fn short_paths_are_left_alone() {
		assert_eq!(to_long_path(r"C:\short\path"), r"C:\short\path");
		assert_eq!(to_long_path(r"\\server\share"), r"\\server\share");
	}

	#[test]
	fn threshold_is_exclusive() {
		let at_limit = local_path_of_len(LONG_PATH_THRESHOLD);
		assert_eq!(to_long_path(&at_limit), at_limit);

		let over_limit = local_path_of_len(LONG_PATH_THRESHOLD + 1);
		assert_eq!(to_long_path(&over_limit), format!(r"\\?\{over_limit}"));
	}

	#[test]
	fn long_local_path_gets_prefixed() {
		let path = local_path_of_len(300);
		assert_eq!(to_long_path(&path), format!(r"\\?\{path}"));
	}

	#[test]
	fn long_unc_path_gets_unc_prefix() {
		let mut path = String::from(r"\\server\share\");
		while path.len() < 300 {
			path.push('a');
		}
		let expected = format!(r"\\?\UNC\{}", &path[2..]);
		assert_eq!(to_long_path(&path), expected);
	}

	#[test]
	fn already_long_paths_are_left_alone() {
		let path = format!(r"\\?\{}", local_path_of_len(300));
		assert_eq!(to_long_path(&path), path);

		let mut unc = String::from(r"\\?\UNC\server\share\");
		while unc.len() < 300 {
			unc.push('a');
		}
		assert_eq!(to_long_path(&unc), unc);
	}

	#[test]
	fn unrecognized_long_paths_are_left_alone() {
		let mut relative = String::from(r"relative\path\");
		while relative.len() < 300 {
			relative.push('a');
		}
		assert_eq!(to_long_path(&relative), relative);
	}

	#[test]
	fn round_trips_back_to_user_facing_form() {
		let local = local_path_of_len(300);
		assert_eq!(to_user_path(&to_long_path(&local)), local);

		let mut unc = String::from(r"\\server\share\");
		while unc.len() < 300 {
			unc.push('a');
		}
		assert_eq!(to_user_path(&to_long_path(&unc)), unc);

		let short = r"C:\short";
		assert_eq!(to_user_path(short), short);
	}
}
