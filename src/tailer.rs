//! Log tailing across glob-matched JSONL files.
//!
//! Each configured glob becomes a [`WatchTarget`] that is re-resolved on every
//! poll. Matched files get a [`Cursor`] recording the byte offset and file
//! identity (device + inode on unix). Identity changes are treated as rotation
//! and size shrinkage as truncation; both restart the cursor at offset 0.
//! Only newline-terminated lines are emitted; a trailing partial line is
//! buffered until its terminator arrives.
//!
//! Uses synchronous `std::fs` reads since these are quick local operations.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::Context;
use globset::{GlobBuilder, GlobMatcher};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Default per-line safety limit (1 MiB).
pub const DEFAULT_MAX_LINE_BYTES: usize = 1_048_576;

/// Identity of one incarnation of a file at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    fn of(meta: &fs::Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        Some(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    #[cfg(not(unix))]
    fn of(_meta: &fs::Metadata) -> Option<Self> {
        None
    }
}

/// Read position within one tailed file.
#[derive(Debug, Clone)]
pub struct Cursor {
    offset: u64,
    identity: Option<FileIdentity>,
    partial: Vec<u8>,
    discarding: bool,
}

impl Cursor {
    fn new(offset: u64, identity: Option<FileIdentity>) -> Self {
        Self {
            offset,
            identity,
            partial: Vec::new(),
            discarding: false,
        }
    }

    /// Byte offset of the next unread byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of buffered bytes belonging to an unterminated line.
    pub fn pending_bytes(&self) -> usize {
        self.partial.len()
    }

    fn reset(&mut self, identity: Option<FileIdentity>) {
        self.offset = 0;
        self.identity = identity;
        self.partial.clear();
        self.discarding = false;
    }
}

/// One complete line read from a tailed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailedLine {
    /// File the line was read from.
    pub path: PathBuf,
    /// Line content without its terminator.
    pub line: String,
}

/// A glob pattern plus the cursors of the files it currently resolves to.
#[derive(Debug)]
pub struct WatchTarget {
    pattern: String,
    root: PathBuf,
    strip_dot: bool,
    max_depth: usize,
    matcher: GlobMatcher,
    cursors: HashMap<PathBuf, Cursor>,
}

impl WatchTarget {
    /// Compile a glob pattern. `*` does not cross directory separators; `**` does.
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern is not a valid glob.
    pub fn new(pattern: &str) -> anyhow::Result<Self> {
        let matcher = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .with_context(|| format!("invalid watch glob {pattern:?}"))?
            .compile_matcher();

        let mut root = PathBuf::new();
        let mut depth: usize = 0;
        let mut recursive = false;
        for component in Path::new(pattern).components() {
            let text = component.as_os_str().to_string_lossy();
            if depth == 0 && !is_glob_component(&text) {
                root.push(component);
                continue;
            }
            if text == "**" {
                recursive = true;
            }
            depth = depth.saturating_add(1);
        }

        // A literal path: watch its parent and match the single file.
        if depth == 0 {
            root = root
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default();
            depth = 1;
        }

        let strip_dot = root.as_os_str().is_empty();
        if strip_dot {
            root = PathBuf::from(".");
        }

        Ok(Self {
            pattern: pattern.to_owned(),
            root,
            strip_dot,
            max_depth: if recursive { usize::MAX } else { depth },
            matcher,
            cursors: HashMap::new(),
        })
    }

    /// The glob pattern as configured.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Deepest directory that contains every possible match.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cursor for a currently tracked file.
    pub fn cursor(&self, path: &Path) -> Option<&Cursor> {
        self.cursors.get(path)
    }

    /// Files currently tracked, in no particular order.
    pub fn tracked(&self) -> impl Iterator<Item = &Path> {
        self.cursors.keys().map(PathBuf::as_path)
    }

    /// Resolve the glob against the filesystem, sorted by path.
    pub fn resolve(&self) -> Vec<PathBuf> {
        if !self.root.is_dir() {
            return Vec::new();
        }

        WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(self.max_depth)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!(pattern = %self.pattern, error = %e, "skipping unreadable entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(walkdir::DirEntry::into_path)
            .filter(|path| self.matches(path))
            .collect()
    }

    fn matches(&self, path: &Path) -> bool {
        if self.strip_dot {
            let relative = path.strip_prefix(".").unwrap_or(path);
            self.matcher.is_match(relative)
        } else {
            self.matcher.is_match(path)
        }
    }
}

/// Whether a path component contains glob metacharacters.
fn is_glob_component(text: &str) -> bool {
    text.contains(|c| matches!(c, '*' | '?' | '[' | '{'))
}

/// Tails every file matched by a set of globs.
///
/// Files present on the first poll start at end-of-file (historical content is
/// not replayed) unless [`LogTailer::replay_from_start`] is set. Files that
/// appear on later polls are read from the beginning.
#[derive(Debug)]
pub struct LogTailer {
    targets: Vec<WatchTarget>,
    replay_from_start: bool,
    max_line_bytes: usize,
    initial_scan_done: bool,
}

impl LogTailer {
    /// Create a tailer for the given glob patterns.
    ///
    /// # Errors
    ///
    /// Returns an error if any pattern is not a valid glob.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> anyhow::Result<Self> {
        let targets = patterns
            .iter()
            .map(|p| WatchTarget::new(p.as_ref()))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            targets,
            replay_from_start: false,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            initial_scan_done: false,
        })
    }

    /// Read files found on the first poll from offset 0 instead of EOF.
    pub fn replay_from_start(mut self, replay: bool) -> Self {
        self.replay_from_start = replay;
        self
    }

    /// Set the maximum accepted line length in bytes. Longer lines are dropped.
    pub fn max_line_bytes(mut self, len: usize) -> Self {
        self.max_line_bytes = len;
        self
    }

    /// The compiled watch targets.
    pub fn targets(&self) -> &[WatchTarget] {
        &self.targets
    }

    /// Existing root directories, for change-notification registration.
    pub fn watch_roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = self
            .targets
            .iter()
            .map(|t| t.root.clone())
            .filter(|r| r.is_dir())
            .collect();
        roots.sort();
        roots.dedup();
        roots
    }

    /// Cursor for a tracked file, searching every target.
    pub fn cursor(&self, path: &Path) -> Option<&Cursor> {
        self.targets.iter().find_map(|t| t.cursor(path))
    }

    /// Re-resolve every glob and read newly appended complete lines.
    ///
    /// Never fails: unreadable files are logged and retried on the next poll,
    /// vanished files are dropped from the watch set.
    pub fn poll(&mut self) -> Vec<TailedLine> {
        let start_at_end = !self.initial_scan_done && !self.replay_from_start;
        let max_line_bytes = self.max_line_bytes;
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut lines = Vec::new();

        for target in &mut self.targets {
            let resolved = target.resolve();
            let current: HashSet<&PathBuf> = resolved.iter().collect();

            target.cursors.retain(|path, _| {
                let keep = current.contains(path);
                if !keep {
                    debug!(path = %path.display(), "file no longer matched, dropping cursor");
                }
                keep
            });

            for path in &resolved {
                // A file matched by several globs is read once, by the first.
                if !seen.insert(path.clone()) {
                    continue;
                }
                poll_file(
                    path,
                    &mut target.cursors,
                    start_at_end,
                    max_line_bytes,
                    &mut lines,
                );
            }
        }

        self.initial_scan_done = true;
        lines
    }
}

/// Advance the cursor for one file and collect its new complete lines.
fn poll_file(
    path: &Path,
    cursors: &mut HashMap<PathBuf, Cursor>,
    start_at_end: bool,
    max_line_bytes: usize,
    out: &mut Vec<TailedLine>,
) {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            cursors.remove(path);
            return;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to stat log file");
            return;
        }
    };
    let size = meta.len();
    let identity = FileIdentity::of(&meta);

    let cursor = cursors.entry(path.to_path_buf()).or_insert_with(|| {
        let mut cursor = Cursor::new(if start_at_end { size } else { 0 }, identity);
        // Joining mid-line would emit a fragment; skip to the next terminator.
        if start_at_end && size > 0 && !ends_with_newline(path, size) {
            cursor.discarding = true;
        }
        debug!(path = %path.display(), offset = cursor.offset, "tracking log file");
        cursor
    });

    if cursor.identity != identity {
        debug!(path = %path.display(), "log file replaced, restarting from offset 0");
        cursor.reset(identity);
    } else if size < cursor.offset {
        debug!(
            path = %path.display(),
            size,
            offset = cursor.offset,
            "log file truncated, restarting from offset 0"
        );
        cursor.reset(identity);
    }

    if size == cursor.offset {
        return;
    }

    let bytes = match read_range(path, cursor.offset, size) {
        Ok(bytes) => bytes,
        Err(e) => {
            // Permission errors and races with the writer are retried next poll.
            warn!(path = %path.display(), error = %e, "failed to read log file");
            return;
        }
    };

    let read_len = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
    cursor.offset = cursor.offset.saturating_add(read_len);
    split_lines(path, cursor, &bytes, max_line_bytes, out);
}

/// Read bytes `[start, end)` from a file.
fn read_range(path: &Path, start: u64, end: u64) -> io::Result<Vec<u8>> {
    let mut file = fs::File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::new();
    file.take(end.saturating_sub(start)).read_to_end(&mut buf)?;
    Ok(buf)
}

fn ends_with_newline(path: &Path, size: u64) -> bool {
    read_range(path, size.saturating_sub(1), size)
        .map(|last| last.last() == Some(&b'\n'))
        .unwrap_or(true)
}

/// Split freshly read bytes into complete lines, buffering the remainder.
fn split_lines(
    path: &Path,
    cursor: &mut Cursor,
    bytes: &[u8],
    max_line_bytes: usize,
    out: &mut Vec<TailedLine>,
) {
    for chunk in bytes.split_inclusive(|b| *b == b'\n') {
        let Some(body) = chunk.strip_suffix(b"\n") else {
            if !cursor.discarding {
                cursor.partial.extend_from_slice(chunk);
                if cursor.partial.len() > max_line_bytes {
                    warn!(
                        path = %path.display(),
                        limit = max_line_bytes,
                        "line exceeds size limit, discarding"
                    );
                    cursor.partial.clear();
                    cursor.discarding = true;
                }
            }
            continue;
        };

        if cursor.discarding {
            cursor.discarding = false;
            cursor.partial.clear();
            continue;
        }

        cursor.partial.extend_from_slice(body);
        let raw = std::mem::take(&mut cursor.partial);
        if raw.len() > max_line_bytes {
            warn!(
                path = %path.display(),
                limit = max_line_bytes,
                "line exceeds size limit, discarding"
            );
            continue;
        }

        let text = String::from_utf8_lossy(&raw);
        let line = text.strip_suffix('\r').unwrap_or(&text);
        out.push(TailedLine {
            path: path.to_path_buf(),
            line: line.to_owned(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_stops_at_first_glob_component() {
        let target = WatchTarget::new("/home/u/.moltbot/agents/*/sessions/*.jsonl")
            .expect("valid glob");
        assert_eq!(target.root(), Path::new("/home/u/.moltbot/agents"));
        assert_eq!(target.max_depth, 3);
    }

    #[test]
    fn double_star_walks_unbounded() {
        let target = WatchTarget::new("/var/log/moltbot/**/*.jsonl").expect("valid glob");
        assert_eq!(target.root(), Path::new("/var/log/moltbot"));
        assert_eq!(target.max_depth, usize::MAX);
    }

    #[test]
    fn literal_path_watches_parent() {
        let target = WatchTarget::new("/tmp/moltbot/session.jsonl").expect("valid glob");
        assert_eq!(target.root(), Path::new("/tmp/moltbot"));
        assert_eq!(target.max_depth, 1);
    }

    #[test]
    fn relative_glob_uses_current_dir() {
        let target = WatchTarget::new("*.jsonl").expect("valid glob");
        assert_eq!(target.root(), Path::new("."));
        assert!(target.matches(Path::new("./a.jsonl")));
        assert!(!target.matches(Path::new("./a.log")));
    }

    #[test]
    fn invalid_glob_is_rejected() {
        assert!(WatchTarget::new("/tmp/[unclosed").is_err());
    }

    #[test]
    fn split_lines_buffers_partial_and_strips_cr() {
        let mut cursor = Cursor::new(0, None);
        let mut out = Vec::new();
        let path = Path::new("x.jsonl");

        split_lines(path, &mut cursor, b"one\r\ntw", 64, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].line, "one");
        assert_eq!(cursor.pending_bytes(), 2);

        split_lines(path, &mut cursor, b"o\n\nthree", 64, &mut out);
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].line, "two");
        assert_eq!(out[2].line, "");
        assert_eq!(cursor.pending_bytes(), 5);
    }

    #[test]
    fn split_lines_discards_oversized_line_up_to_terminator() {
        let mut cursor = Cursor::new(0, None);
        let mut out = Vec::new();
        let path = Path::new("x.jsonl");

        split_lines(path, &mut cursor, b"0123456789", 4, &mut out);
        assert!(out.is_empty());
        split_lines(path, &mut cursor, b"abc\nok\n", 4, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].line, "ok");
    }
}
