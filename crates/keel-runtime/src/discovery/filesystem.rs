use std::io;
use std::path::{Component, Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;

use keel_core::error::{KeelError, Result};
use keel_core::provider::{sort_scripts, ScriptProvider};
use keel_core::script::Script;
use keel_core::BoxFuture;

/// Reads scripts from a directory tree.
///
/// Script names are paths relative to the root, joined with `/`, so
/// `v2/001_init.sql` sorts and journals the same on every platform.
#[derive(Debug, Clone)]
pub struct FileSystemScriptProvider {
    root: PathBuf,
    recursive: bool,
    extensions: Vec<String>,
    excluded_dirs: Vec<String>,
}

impl FileSystemScriptProvider {
    /// Recursive `.sql` provider rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            recursive: true,
            extensions: vec![".sql".to_string()],
            excluded_dirs: Vec::new(),
        }
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Replace the accepted extensions, e.g. `[".sql", ".psql"]`.
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|e| e.into().to_ascii_lowercase())
            .collect();
        self
    }

    /// Skip sub-directories with this name at any depth.
    pub fn exclude_dir(mut self, name: impl Into<String>) -> Self {
        self.excluded_dirs.push(name.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn accepts(&self, path: &Path) -> bool {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let lower = file_name.to_ascii_lowercase();
        self.extensions
            .iter()
            .any(|ext| lower.len() > ext.len() && lower.ends_with(ext.as_str()))
    }

    fn is_excluded(&self, name: &str) -> bool {
        self.excluded_dirs
            .iter()
            .any(|excluded| excluded.eq_ignore_ascii_case(name))
    }

    /// Matching file paths, unordered.
    fn discover_paths(&self) -> Result<Vec<PathBuf>> {
        let mut walker = WalkDir::new(&self.root).follow_links(true);
        if !self.recursive {
            walker = walker.max_depth(1);
        }

        let mut paths = Vec::new();
        let entries = walker.into_iter().filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !entry
                    .file_name()
                    .to_str()
                    .map(|name| self.is_excluded(name))
                    .unwrap_or(false)
        });

        for entry in entries {
            let entry = entry.map_err(|e| KeelError::ScriptDiscovery {
                path: e
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| self.root.clone()),
                source: io::Error::from(e),
            })?;
            if entry.file_type().is_file() && self.accepts(entry.path()) {
                paths.push(entry.into_path());
            }
        }

        Ok(paths)
    }

    fn script_name(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl ScriptProvider for FileSystemScriptProvider {
    fn get_scripts<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, Result<Vec<Script>>> {
        Box::pin(async move {
            if !self.root.exists() {
                debug!("Script directory does not exist: {:?}", self.root);
                return Ok(Vec::new());
            }

            let mut scripts = Vec::new();
            for path in self.discover_paths()? {
                if cancel.is_cancelled() {
                    return Err(KeelError::Cancelled);
                }
                let text = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|source| KeelError::ScriptDiscovery {
                        path: path.clone(),
                        source,
                    })?;
                let name = self.script_name(&path);
                scripts.push(Script::from_text(name, text).with_path(path));
            }

            sort_scripts(&mut scripts);
            debug!(root = ?self.root, count = scripts.len(), "Loaded scripts");
            Ok(scripts)
        })
    }
}
