//! Tests for `src/tailer.rs`: chunked appends, rotation, truncation and
//! discovery of new session files.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use moltbot_watcher::tailer::LogTailer;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn append(path: &Path, text: &str) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .expect("open log for append");
    file.write_all(text.as_bytes()).expect("append to log");
}

fn glob(dir: &Path, pattern: &str) -> String {
    dir.join(pattern).to_string_lossy().into_owned()
}

fn lines(tailer: &mut LogTailer) -> Vec<String> {
    tailer.poll().into_iter().map(|l| l.line).collect()
}

/// A tailer whose initial scan has already happened on an empty directory.
fn primed_tailer(dir: &Path) -> LogTailer {
    let mut tailer = LogTailer::new(&[glob(dir, "*.jsonl")]).expect("valid glob");
    assert!(tailer.poll().is_empty());
    tailer
}

// ---------------------------------------------------------------------------
// Appends
// ---------------------------------------------------------------------------

#[test]
fn emits_each_complete_line_once_regardless_of_chunking() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("session.jsonl");
    let mut tailer = primed_tailer(dir.path());

    let chunks = ["line one\nline t", "wo\nline three\n", "", "line fo", "ur"];
    let mut emitted = Vec::new();
    for chunk in chunks {
        append(&path, chunk);
        emitted.extend(lines(&mut tailer));
    }

    assert_eq!(emitted, vec!["line one", "line two", "line three"]);
    assert_eq!(
        tailer.cursor(&path).expect("tracked").pending_bytes(),
        "line four".len()
    );

    append(&path, "\n");
    assert_eq!(lines(&mut tailer), vec!["line four"]);
    assert!(lines(&mut tailer).is_empty());
}

#[test]
fn crlf_is_stripped_and_blank_lines_are_kept() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("session.jsonl");
    let mut tailer = primed_tailer(dir.path());

    append(&path, "{\"a\":1}\r\n\n   \n{\"b\":2}\n");
    assert_eq!(lines(&mut tailer), vec!["{\"a\":1}", "", "   ", "{\"b\":2}"]);
}

#[test]
fn emitted_lines_reassemble_the_appended_content() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("session.jsonl");
    let mut tailer = primed_tailer(dir.path());

    let content = "first\n\n  \n{\"x\":1}\nlast\n";
    let mut emitted = Vec::new();
    for chunk in content.as_bytes().chunks(3) {
        append(&path, std::str::from_utf8(chunk).expect("ascii chunk"));
        emitted.extend(lines(&mut tailer));
    }

    let rebuilt: String = emitted.iter().map(|l| format!("{l}\n")).collect();
    assert_eq!(rebuilt, content);
}

#[test]
fn over_long_lines_are_discarded() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("session.jsonl");
    let mut tailer = LogTailer::new(&[glob(dir.path(), "*.jsonl")])
        .expect("valid glob")
        .max_line_bytes(8);
    assert!(tailer.poll().is_empty());

    append(&path, "short\nthis line is far too long\nok\n");
    assert_eq!(lines(&mut tailer), vec!["short", "ok"]);
}

// ---------------------------------------------------------------------------
// Initial scan and discovery
// ---------------------------------------------------------------------------

#[test]
fn existing_content_is_skipped_on_first_poll() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("session.jsonl");
    append(&path, "historical\n");

    let mut tailer = LogTailer::new(&[glob(dir.path(), "*.jsonl")]).expect("valid glob");
    assert!(lines(&mut tailer).is_empty());

    append(&path, "fresh\n");
    assert_eq!(lines(&mut tailer), vec!["fresh"]);
}

#[test]
fn joining_mid_line_skips_the_fragment() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("session.jsonl");
    append(&path, "historical\nhalf a li");

    let mut tailer = LogTailer::new(&[glob(dir.path(), "*.jsonl")]).expect("valid glob");
    assert!(lines(&mut tailer).is_empty());

    append(&path, "ne\nnext\n");
    assert_eq!(lines(&mut tailer), vec!["next"]);
}

#[test]
fn replay_from_start_reads_existing_content() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("session.jsonl");
    append(&path, "first\nsecond\n");

    let mut tailer = LogTailer::new(&[glob(dir.path(), "*.jsonl")])
        .expect("valid glob")
        .replay_from_start(true);
    assert_eq!(lines(&mut tailer), vec!["first", "second"]);
}

#[test]
fn files_created_after_startup_are_read_from_the_beginning() {
    let dir = tempfile::tempdir().expect("temp dir");
    let sessions = dir.path().join("agents").join("main").join("sessions");
    fs::create_dir_all(&sessions).expect("create sessions dir");

    let pattern = glob(dir.path(), "agents/*/sessions/*.jsonl");
    let mut tailer = LogTailer::new(&[pattern]).expect("valid glob");
    assert!(tailer.poll().is_empty());

    let path = sessions.join("new-session.jsonl");
    append(&path, "hello\n");
    let polled = tailer.poll();
    assert_eq!(polled.len(), 1);
    assert_eq!(polled[0].line, "hello");
    assert_eq!(polled[0].path, path);
}

#[test]
fn non_matching_files_are_ignored() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut tailer = primed_tailer(dir.path());

    append(&dir.path().join("notes.txt"), "not a session\n");
    fs::create_dir_all(dir.path().join("nested")).expect("create nested dir");
    append(&dir.path().join("nested").join("deep.jsonl"), "too deep\n");

    assert!(tailer.poll().is_empty());
}

#[test]
fn file_matched_by_two_globs_is_read_once() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("session.jsonl");
    let mut tailer = LogTailer::new(&[glob(dir.path(), "*.jsonl"), glob(dir.path(), "session.*")])
        .expect("valid globs");
    assert!(tailer.poll().is_empty());

    append(&path, "once\n");
    assert_eq!(lines(&mut tailer), vec!["once"]);
}

// ---------------------------------------------------------------------------
// Rotation, truncation, removal
// ---------------------------------------------------------------------------

#[test]
fn rotation_restarts_from_new_file_content() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("session.jsonl");
    let mut tailer = primed_tailer(dir.path());

    append(&path, "old one\nold two\n");
    assert_eq!(lines(&mut tailer), vec!["old one", "old two"]);

    // Build the replacement beside the original so it gets a distinct inode.
    let replacement: PathBuf = dir.path().join("session.jsonl.tmp");
    append(&replacement, "new one\nnew two\nnew three\n");
    fs::rename(&replacement, &path).expect("rotate log");

    assert_eq!(lines(&mut tailer), vec!["new one", "new two", "new three"]);
}

#[test]
fn truncation_restarts_from_offset_zero() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("session.jsonl");
    let mut tailer = primed_tailer(dir.path());

    append(&path, "a fairly long first line\nand another\n");
    assert_eq!(lines(&mut tailer).len(), 2);

    fs::write(&path, "short\n").expect("truncate log");
    assert_eq!(lines(&mut tailer), vec!["short"]);
    assert_eq!(
        tailer.cursor(&path).expect("tracked").offset(),
        "short\n".len() as u64
    );
}

#[test]
fn vanished_file_is_dropped_without_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("session.jsonl");
    let mut tailer = primed_tailer(dir.path());

    append(&path, "line\n");
    assert_eq!(lines(&mut tailer), vec!["line"]);

    fs::remove_file(&path).expect("remove log");
    assert!(tailer.poll().is_empty());
    assert!(tailer.cursor(&path).is_none());

    // A new file at the same path is a new discovery, read from 0.
    append(&path, "again\n");
    assert_eq!(lines(&mut tailer), vec!["again"]);
}

#[test]
fn missing_root_directory_yields_nothing() {
    let dir = tempfile::tempdir().expect("temp dir");
    let pattern = glob(&dir.path().join("does-not-exist"), "*.jsonl");
    let mut tailer = LogTailer::new(&[pattern]).expect("valid glob");
    assert!(tailer.poll().is_empty());
    assert!(tailer.watch_roots().is_empty());
}

#[cfg(unix)]
#[test]
fn unreadable_file_is_retried_on_next_poll() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("session.jsonl");
    let mut tailer = primed_tailer(dir.path());

    append(&path, "");
    assert!(tailer.poll().is_empty());

    append(&path, "secret\n");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o000)).expect("chmod 000");
    let blocked = tailer.poll();

    fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).expect("chmod 600");
    let retried = tailer.poll();

    // Root ignores file modes, in which case the first poll already succeeds.
    let all: Vec<String> = blocked.into_iter().chain(retried).map(|l| l.line).collect();
    assert_eq!(all, vec!["secret"]);
}
