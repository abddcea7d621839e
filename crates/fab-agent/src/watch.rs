//! Config file watching.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{info, trace, warn};

use crate::debounce::Notifier;
use crate::error::Result;

/// Notifies on changes to a set of files.
///
/// Parent directories are watched so that files replaced by rename, or not
/// yet created, are still seen. Dropping the value stops the watch.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn is_relevant(event: &Event, names: &BTreeSet<OsString>) -> bool {
    if event.kind.is_access() {
        return false;
    }
    event.paths.iter().any(|p| {
        p.file_name().is_some_and(|name| {
            // ConfigMap volumes swap a `..data` symlink instead of the file.
            names.contains(name) || name.to_string_lossy().starts_with("..")
        })
    })
}

impl ConfigWatcher {
    /// Starts watching `files`; every relevant event calls `notifier`.
    pub fn new(files: &[PathBuf], notifier: Notifier) -> Result<Self> {
        let names: BTreeSet<OsString> = files
            .iter()
            .filter_map(|f| f.file_name().map(ToOwned::to_owned))
            .collect();
        let dirs: BTreeSet<PathBuf> = files.iter().map(|f| parent_dir(f)).collect();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if is_relevant(&event, &names) => {
                trace!(paths = ?event.paths, kind = ?event.kind, "config changed");
                notifier.notify();
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "file watch error"),
        })?;

        for dir in &dirs {
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
            info!(dir = %dir.display(), "watching config directory");
        }

        Ok(Self { _watcher: watcher })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debounce;
    use notify::EventKind;
    use notify::event::{AccessKind, CreateKind, ModifyKind};
    use std::time::Duration;

    fn names(list: &[&str]) -> BTreeSet<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn test_relevance_filter() {
        let watched = names(&["tunnels.yaml"]);

        let modify = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/etc/fabedge/tunnels.yaml"));
        assert!(is_relevant(&modify, &watched));

        let other = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/etc/fabedge/other.yaml"));
        assert!(!is_relevant(&other, &watched));

        let swap = Event::new(EventKind::Create(CreateKind::Any))
            .add_path(PathBuf::from("/etc/fabedge/..data"));
        assert!(is_relevant(&swap, &watched));

        let read = Event::new(EventKind::Access(AccessKind::Any))
            .add_path(PathBuf::from("/etc/fabedge/tunnels.yaml"));
        assert!(!is_relevant(&read, &watched));
    }

    #[test]
    fn test_parent_dir_of_bare_file_name() {
        assert_eq!(parent_dir(Path::new("tunnels.yaml")), PathBuf::from("."));
        assert_eq!(parent_dir(Path::new("/etc/a.yaml")), PathBuf::from("/etc"));
    }

    #[tokio::test]
    async fn test_write_triggers_notification() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("tunnels.yaml");
        std::fs::write(&file, "name: edge1\n").expect("write");

        let (notifier, mut notifications) = debounce::channel();
        let _watcher = ConfigWatcher::new(&[file.clone()], notifier).expect("watcher");

        std::fs::write(&file, "name: edge2\n").expect("rewrite");
        let received = tokio::time::timeout(Duration::from_secs(5), notifications.recv()).await;
        assert_eq!(received, Ok(Some(())));
    }
}
