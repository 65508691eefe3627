//! Discovered scripts and their content hashes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::database::ConnectionManager;
use crate::error::Result;
use crate::substitution::Variables;
use crate::BoxFuture;

/// A named script discovered by a provider.
///
/// The hash is computed once at construction and identifies the script in the
/// journal. Editing a script's text therefore yields a different script.
#[derive(Clone)]
pub struct Script {
    name: String,
    contents: ScriptContents,
    hash: String,
    path: Option<PathBuf>,
}

/// What a script runs: fixed text, or text produced at execution time.
#[derive(Clone)]
pub enum ScriptContents {
    /// Plain script text.
    Static(String),
    /// Text produced by host code against the live database.
    Generated(Arc<dyn ScriptGenerator>),
}

impl fmt::Debug for ScriptContents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(text) => f.debug_tuple("Static").field(&text.len()).finish(),
            Self::Generated(_) => f.write_str("Generated(..)"),
        }
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script")
            .field("name", &self.name)
            .field("contents", &self.contents)
            .field("hash", &self.hash)
            .field("path", &self.path)
            .finish()
    }
}

impl Script {
    /// Create a script from plain text. The hash covers the text only.
    pub fn from_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            name: name.into(),
            hash: content_hash(&text),
            contents: ScriptContents::Static(text),
            path: None,
        }
    }

    /// Create a script from a packaged resource. The hash also covers the
    /// namespace and name, so identical resources in two packages stay distinct.
    pub fn packaged(namespace: &str, name: impl Into<String>, text: impl Into<String>) -> Self {
        let name = name.into();
        let text = text.into();
        let hash = hash_parts(&[namespace, &name, &text]);
        Self {
            name,
            hash,
            contents: ScriptContents::Static(text),
            path: None,
        }
    }

    /// Create a script whose text is produced by `generator` at execution time.
    pub fn generated(name: impl Into<String>, generator: Arc<dyn ScriptGenerator>) -> Self {
        let name = name.into();
        let hash = hash_parts(&["generated", &name, &generator.fingerprint()]);
        Self {
            name,
            hash,
            contents: ScriptContents::Generated(generator),
            path: None,
        }
    }

    /// Record where the script was read from.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn contents(&self) -> &ScriptContents {
        &self.contents
    }

    /// Source location, when the script came from the filesystem.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The static text, or `None` for generated scripts.
    pub fn text(&self) -> Option<&str> {
        match &self.contents {
            ScriptContents::Static(text) => Some(text),
            ScriptContents::Generated(_) => None,
        }
    }

    pub fn is_generated(&self) -> bool {
        matches!(self.contents, ScriptContents::Generated(_))
    }
}

/// Host code that produces script text against a live connection.
pub trait ScriptGenerator: Send + Sync {
    /// Extra identity folded into the script hash.
    ///
    /// Generated text is unknown until execution, so the hash is derived from
    /// the script name plus this value. Change it to make the engine treat the
    /// generator as a new, never-executed script.
    fn fingerprint(&self) -> String {
        String::new()
    }

    /// Whether [`GeneratedScript::downgrade`] is populated.
    fn supports_downgrade(&self) -> bool {
        false
    }

    /// Produce the script text.
    fn generate<'a>(&'a self, ctx: &'a GeneratorContext<'a>) -> BoxFuture<'a, Result<GeneratedScript>>;
}

/// Output of a [`ScriptGenerator`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratedScript {
    pub upgrade: String,
    pub downgrade: Option<String>,
}

impl GeneratedScript {
    pub fn new(upgrade: impl Into<String>) -> Self {
        Self {
            upgrade: upgrade.into(),
            downgrade: None,
        }
    }

    pub fn with_downgrade(mut self, downgrade: impl Into<String>) -> Self {
        self.downgrade = Some(downgrade.into());
        self
    }
}

/// Everything a generator may use while producing text.
pub struct GeneratorContext<'a> {
    /// Connection source for queries the generator needs to run.
    pub connections: &'a dyn ConnectionManager,
    /// Read-only substitution variables.
    pub variables: &'a Variables,
    pub cancel: &'a CancellationToken,
}

/// SHA-256 of the text, hex encoded.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        // Separator keeps ("ab", "c") and ("a", "bc") apart.
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}
