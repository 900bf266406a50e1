//! # Archiver
//!
//! To package a project directory we use the tar format, which can be written
//! sequentially and doesn't require seeking.
//!
//! The directory is walked depth-first, with the entries of every directory sorted by
//! file name, so `a/x` precedes `a.txt`. Every entry is checked against
//! the project [ignore rules](crate::ignore_file), and excluded directories are pruned
//! from the walk entirely, so none of their descendants are ever visited.
//!
//! Tar headers are written in deterministic mode: modification times, ownership and
//! permissions are normalized, thus two archives of an unchanged directory are
//! byte-identical.

use std::{
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, StripPrefixError},
};

use common::hash::HashingWriter;
use derive_more::{Display, Error, From};
use tar::{EntryType, Header, HeaderMode};
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use walkdir::{DirEntry, WalkDir};

use crate::ignore_file::IgnoreMatcher;

/// Errors that may occur during the archive creation process.
#[derive(Debug, Display, From, Error)]
pub(crate) enum ArchiveError {
    /// Source directory does not exist.
    #[display(fmt = "source directory {} does not exist", _0)]
    #[from(ignore)]
    RootNotFound(#[error(not(source))] String),

    /// [`walkdir`]-crate specific error.
    Walk(walkdir::Error),

    /// File became unreadable during the walk.
    #[display(fmt = "unable to read {}: {}", path, source)]
    #[from(ignore)]
    Read {
        /// Path of the unreadable file.
        path: String,

        /// Underlying IO error.
        source: io::Error,
    },

    /// IO error while writing the archive.
    Io(io::Error),

    /// Unable to strip source directory prefix from path.
    StripPrefix(StripPrefixError),

    /// Archiving was cancelled.
    #[display(fmt = "archiving cancelled")]
    Cancelled,
}

/// Symbolic link handling policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum SymlinkPolicy {
    /// Store symbolic links as link entries without following them.
    #[default]
    Preserve,

    /// Follow symbolic links and archive their targets.
    ///
    /// Link cycles are reported by the walker as errors.
    Follow,
}

/// Archive creation options.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ArchiveOptions {
    /// Symbolic link handling policy.
    pub symlinks: SymlinkPolicy,
}

/// Information about a finished archive.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ArchiveSummary {
    /// Amount of entries written to the archive.
    pub entries: usize,

    /// Archive size, in bytes.
    pub size: u64,
}

/// Archive spooled to a temporary file.
pub(crate) struct BuiltArchive {
    /// Temporary file containing the archive, rewound to the start.
    pub file: NamedTempFile,

    /// Archive summary.
    pub summary: ArchiveSummary,

    /// Hex-encoded blake2 hash of the archive.
    pub hash: String,
}

/// Archive the `root` directory into a temporary file.
///
/// The temporary file is removed if archiving fails, so a partially written
/// archive can never be uploaded.
pub(crate) fn build_archive_file(
    root: &Path,
    matcher: &IgnoreMatcher,
    options: ArchiveOptions,
    cancel: &CancellationToken,
) -> Result<BuiltArchive, ArchiveError> {
    let file = NamedTempFile::new()?;

    let mut writer = HashingWriter::new(file);
    let entries = build_tar_archive(root, matcher, options, cancel, &mut writer)?;
    let size = writer.written();
    let (mut file, digest) = writer.finalize();

    file.flush()?;
    file.seek(SeekFrom::Start(0))?;

    Ok(BuiltArchive {
        file,
        summary: ArchiveSummary { entries, size },
        hash: hex::encode(digest),
    })
}

/// Archive the `root` directory into the provided `writer`.
///
/// Returns the amount of written entries.
pub(crate) fn build_tar_archive<W: Write>(
    root: &Path,
    matcher: &IgnoreMatcher,
    options: ArchiveOptions,
    cancel: &CancellationToken,
    writer: W,
) -> Result<usize, ArchiveError> {
    if !root.is_dir() {
        return Err(ArchiveError::RootNotFound(root.display().to_string()));
    }

    let mut builder = tar::Builder::new(writer);
    builder.mode(HeaderMode::Deterministic);
    builder.follow_symlinks(options.symlinks == SymlinkPolicy::Follow);

    let mut count = 0;

    for entry in walk_project_directory(root, matcher, options.symlinks) {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }

        let entry = entry?;
        let relative = entry.path().strip_prefix(root)?;

        if relative.as_os_str().is_empty() {
            continue;
        }

        let file_type = entry.file_type();

        if file_type.is_dir() {
            builder.append_dir(relative, entry.path())?;
        } else if file_type.is_symlink() {
            append_symlink(&mut builder, &entry, relative)?;
        } else if file_type.is_file() {
            append_file(&mut builder, &entry, relative, cancel)?;
        } else {
            // Sockets, FIFOs and device files have no meaningful archived representation.
            continue;
        }

        count += 1;
    }

    builder.into_inner()?.flush()?;

    Ok(count)
}

/// Append a regular file, reading its contents in a cancellable manner.
fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    entry: &DirEntry,
    relative: &Path,
    cancel: &CancellationToken,
) -> Result<(), ArchiveError> {
    let read_error = |source| ArchiveError::Read {
        path: entry.path().display().to_string(),
        source,
    };

    let file = File::open(entry.path()).map_err(read_error)?;
    let metadata = file.metadata().map_err(read_error)?;

    let mut header = Header::new_gnu();
    header.set_metadata_in_mode(&metadata, HeaderMode::Deterministic);

    let reader = CancellableReader {
        inner: file,
        cancel,
    };

    builder
        .append_data(&mut header, relative, reader)
        .map_err(|err| {
            if cancel.is_cancelled() {
                ArchiveError::Cancelled
            } else {
                read_error(err)
            }
        })
}

/// Append a symbolic link entry without following it.
fn append_symlink<W: Write>(
    builder: &mut tar::Builder<W>,
    entry: &DirEntry,
    relative: &Path,
) -> Result<(), ArchiveError> {
    let read_error = |source| ArchiveError::Read {
        path: entry.path().display().to_string(),
        source,
    };

    let metadata = fs::symlink_metadata(entry.path()).map_err(read_error)?;
    let target = fs::read_link(entry.path()).map_err(read_error)?;

    let mut header = Header::new_gnu();
    header.set_metadata_in_mode(&metadata, HeaderMode::Deterministic);
    header.set_entry_type(EntryType::Symlink);
    header.set_size(0);
    header.set_link_name(&target)?;

    builder.append_data(&mut header, relative, io::empty())?;

    Ok(())
}

/// Recursively iterate over the project files and directories while filtering them.
///
/// Returned [`Iterator`] yields entries depth-first, sorted by file name within every
/// directory, and never descends into directories excluded by the provided [`IgnoreMatcher`].
fn walk_project_directory<'a>(
    root: &'a Path,
    matcher: &'a IgnoreMatcher,
    symlinks: SymlinkPolicy,
) -> impl Iterator<Item = Result<DirEntry, walkdir::Error>> + 'a {
    WalkDir::new(root)
        .follow_links(symlinks == SymlinkPolicy::Follow)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| match entry.path().strip_prefix(root) {
            Ok(relative) => !matcher.is_excluded(relative, entry.file_type().is_dir()),
            Err(_) => true,
        })
}

/// [`Read`] adapter which fails as soon as the cancellation is requested.
struct CancellableReader<'a, R> {
    /// Underlying reader.
    inner: R,

    /// Cancellation token observed on every read.
    cancel: &'a CancellationToken,
}

impl<R: Read> Read for CancellableReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Other, "archiving cancelled"));
        }

        self.inner.read(buf)
    }
}

/// Hash of the archive bytes, used by tests to compare archives.
#[cfg(test)]
fn archive_hash(archive: &[u8]) -> String {
    hex::encode(common::hash::blake2(archive))
}

/// List entry paths of an in-memory tar archive.
#[cfg(test)]
pub(crate) fn list_entries(archive: impl Read) -> Vec<std::path::PathBuf> {
    tar::Archive::new(archive)
        .entries()
        .expect("unable to read archive")
        .map(|entry| {
            entry
                .expect("unable to read archive entry")
                .path()
                .expect("invalid entry path")
                .into_owned()
        })
        .collect()
}
