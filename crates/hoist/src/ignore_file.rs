//! # Ignore rules
//!
//! Project directories are filtered with an ignore file placed at the project root,
//! which uses the same syntax as `.gitignore`: one glob pattern per line, `#` comments,
//! and `!`-prefixed patterns that re-include paths excluded by an earlier line.
//!
//! Patterns are evaluated in file order, so the last matching pattern wins.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::warn;

/// Ignore file name, looked up in the project root.
pub(crate) const IGNORE_FILE_NAME: &str = ".hoistignore";

/// Compiled set of ignore rules.
#[derive(Clone)]
pub(crate) struct IgnoreMatcher {
    /// Underlying gitignore-compatible matcher.
    rules: Gitignore,
}

impl IgnoreMatcher {
    /// Matcher that never excludes anything.
    pub(crate) fn empty() -> Self {
        Self {
            rules: Gitignore::empty(),
        }
    }

    /// Load rules from the ignore file inside of the provided `root` directory.
    ///
    /// Absence of the ignore file is not an error, an empty matcher is returned instead.
    pub(crate) fn from_root(root: &Path) -> Result<Self, io::Error> {
        Self::from_file(root, &root.join(IGNORE_FILE_NAME))
    }

    /// Load rules from an arbitrary `file`, with patterns anchored at `root`.
    pub(crate) fn from_file(root: &Path, file: &Path) -> Result<Self, io::Error> {
        match fs::read_to_string(file) {
            Ok(contents) => Ok(Self::from_lines(
                root,
                Some(file.to_path_buf()),
                contents.lines(),
            )),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::empty()),
            Err(err) => Err(err),
        }
    }

    /// Compile rules from the provided lines.
    ///
    /// Lines that cannot be parsed are skipped with a warning.
    pub(crate) fn from_lines<'a>(
        root: &Path,
        source: Option<PathBuf>,
        lines: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let mut builder = GitignoreBuilder::new(root);

        for (number, line) in lines.into_iter().enumerate() {
            if let Err(err) = builder.add_line(source.clone(), line) {
                warn!(
                    file = ?source,
                    line = number + 1,
                    %err,
                    "skipping malformed ignore pattern"
                );
            }
        }

        let rules = builder.build().unwrap_or_else(|err| {
            warn!(%err, "unable to compile ignore rules, nothing will be excluded");
            Gitignore::empty()
        });

        Self { rules }
    }

    /// Check whether the provided relative path must be excluded.
    ///
    /// A path is excluded if it, or any of its parent directories, is matched by
    /// an exclusion rule that isn't overridden by a later negated rule.
    pub(crate) fn is_excluded(&self, relative_path: &Path, is_dir: bool) -> bool {
        if relative_path.as_os_str().is_empty() || relative_path.has_root() {
            return false;
        }

        self.rules
            .matched_path_or_any_parents(relative_path, is_dir)
            .is_ignore()
    }

    /// Amount of compiled rules.
    pub(crate) fn len(&self) -> usize {
        self.rules.len()
    }
}
