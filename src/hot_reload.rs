// Shader hot reload
//
// Watches the directories holding the shader binaries and raises a flag when
// one of them is written. The render thread polls the flag between frames;
// the watcher callback runs on notify's own thread.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

pub struct ShaderWatcher {
    // Dropping the watcher stops the background thread
    _watcher: RecommendedWatcher,
    changed: Arc<Mutex<bool>>,
}

impl ShaderWatcher {
    pub fn new(files: &[&Path]) -> Result<Self> {
        let watched: Vec<PathBuf> = files.iter().map(|f| normalize(f)).collect();
        let changed = Arc::new(Mutex::new(false));

        let flag = changed.clone();
        let targets = watched.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if is_relevant(&event, &targets) => {
                log::debug!("Shader change detected: {:?}", event.paths);
                *flag.lock() = true;
            }
            Ok(_) => {}
            Err(e) => log::warn!("Shader watcher error: {}", e),
        })
        .context("Failed to create shader watcher")?;

        // Editors often replace files instead of writing in place, so the
        // parent directory is watched rather than the file itself
        let dirs: BTreeSet<PathBuf> = watched.iter().map(|f| watch_dir(f)).collect();
        for dir in &dirs {
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("Failed to watch {:?}", dir))?;
            log::info!("Watching {:?} for shader changes", dir);
        }

        Ok(Self {
            _watcher: watcher,
            changed,
        })
    }

    /// True once per burst of changes since the last call
    pub fn take_changed(&self) -> bool {
        std::mem::take(&mut *self.changed.lock())
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

fn watch_dir(file: &Path) -> PathBuf {
    match file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Writes or re-creations of one of `files`; event paths are usually absolute
pub fn is_relevant(event: &Event, files: &[PathBuf]) -> bool {
    let content_changed = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_));
    content_changed
        && event
            .paths
            .iter()
            .any(|path| files.iter().any(|file| path.ends_with(file)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind, RemoveKind};

    fn watched() -> Vec<PathBuf> {
        vec![normalize(Path::new("./shaders/quad.vert.spv"))]
    }

    #[test]
    fn write_to_a_watched_binary_is_relevant() {
        let event = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/home/user/quad/shaders/quad.vert.spv"));
        assert!(is_relevant(&event, &watched()));

        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("shaders/quad.vert.spv"));
        assert!(is_relevant(&event, &watched()));
    }

    #[test]
    fn other_files_and_event_kinds_are_ignored() {
        let sibling = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/home/user/quad/shaders/quad.vert"));
        assert!(!is_relevant(&sibling, &watched()));

        let read = Event::new(EventKind::Access(AccessKind::Any))
            .add_path(PathBuf::from("/home/user/quad/shaders/quad.vert.spv"));
        assert!(!is_relevant(&read, &watched()));

        let removed = Event::new(EventKind::Remove(RemoveKind::File))
            .add_path(PathBuf::from("/home/user/quad/shaders/quad.vert.spv"));
        assert!(!is_relevant(&removed, &watched()));
    }

    #[test]
    fn bare_file_names_watch_the_current_directory() {
        assert_eq!(watch_dir(Path::new("quad.frag.spv")), PathBuf::from("."));
        assert_eq!(watch_dir(&normalize(Path::new("./shaders/a.spv"))), PathBuf::from("shaders"));
    }
}
