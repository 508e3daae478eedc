//! Process helpers shared across the workspace.
//!
//! - [`CommandExt`] applies the spawn conventions used for task scripts
//!   (no console window on Windows, augmented search path).
//! - [`OutputRecordReader`] splits child output on both `\n` and `\r`, which
//!   encoders use to redraw their status line in place.

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

#[cfg(feature = "tokio")]
mod record_reader;

#[cfg(feature = "tokio")]
pub use record_reader::OutputRecordReader;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Build the value of a path-list environment variable with `dirs` placed in
/// front of whatever `current` already holds.
///
/// Empty entries in `current` are dropped. Returns `None` when the result would
/// be empty or when one of the directories contains the platform separator.
pub fn prepend_search_path(dirs: &[PathBuf], current: Option<&OsStr>) -> Option<OsString> {
    let mut entries: Vec<PathBuf> = dirs.to_vec();
    if let Some(current) = current {
        entries.extend(std::env::split_paths(current).filter(|p| !p.as_os_str().is_empty()));
    }
    if entries.is_empty() {
        return None;
    }
    std::env::join_paths(entries).ok()
}

/// Spawn conventions for task programs.
pub trait CommandExt {
    /// Apply the Windows `CREATE_NO_WINDOW` flag. No-op elsewhere.
    fn no_window(&mut self) -> &mut Self;

    /// Prepend `dirs` to the path-list variable `var` of the child environment,
    /// keeping the value inherited from this process.
    fn search_path(&mut self, var: &str, dirs: &[PathBuf]) -> &mut Self;
}

impl CommandExt for std::process::Command {
    fn no_window(&mut self) -> &mut Self {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt as _;
            self.creation_flags(CREATE_NO_WINDOW);
        }
        self
    }

    fn search_path(&mut self, var: &str, dirs: &[PathBuf]) -> &mut Self {
        let inherited = std::env::var_os(var);
        if let Some(value) = prepend_search_path(dirs, inherited.as_deref()) {
            self.env(var, value);
        }
        self
    }
}

#[cfg(feature = "tokio")]
impl CommandExt for tokio::process::Command {
    fn no_window(&mut self) -> &mut Self {
        self.as_std_mut().no_window();
        self
    }

    fn search_path(&mut self, var: &str, dirs: &[PathBuf]) -> &mut Self {
        self.as_std_mut().search_path(var, dirs);
        self
    }
}

/// Create a `tokio::process::Command` that is killed when its handle is dropped
/// and never opens a console window.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(true);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepends_before_inherited_entries() {
        let current = std::env::join_paths(["/usr/lib/py", "/opt/py"]).unwrap();
        let value = prepend_search_path(&[PathBuf::from("/srv/app")], Some(&current)).unwrap();
        let parts: Vec<PathBuf> = std::env::split_paths(&value).collect();
        assert_eq!(
            parts,
            vec![
                PathBuf::from("/srv/app"),
                PathBuf::from("/usr/lib/py"),
                PathBuf::from("/opt/py"),
            ]
        );
    }

    #[test]
    fn empty_inputs_yield_nothing() {
        assert!(prepend_search_path(&[], None).is_none());
        assert!(prepend_search_path(&[], Some(OsStr::new(""))).is_none());
    }

    #[test]
    fn sets_variable_on_std_command() {
        let mut cmd = std::process::Command::new("true");
        cmd.search_path("JOB_RUNNER_TEST_SEARCH_PATH", &[PathBuf::from("/srv/app")]);
        let value = cmd
            .get_envs()
            .find(|(k, _)| *k == OsStr::new("JOB_RUNNER_TEST_SEARCH_PATH"))
            .and_then(|(_, v)| v.map(|v| v.to_os_string()));
        assert_eq!(value, Some(OsString::from("/srv/app")));
    }
}
