use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::model::FileSnapshot;

const BINARY_CHECK_BYTES: usize = 4096;

/// Checks that a patch path stays inside the project: relative, no `..`, no drive prefix.
pub fn validate_relative(path: &str) -> std::result::Result<(), String> {
    if path.trim().is_empty() {
        return Err("path is empty".into());
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Err("path is absolute".into());
    }
    let mut has_name = false;
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) => has_name = true,
            Component::CurDir => {}
            Component::ParentDir => return Err("path escapes the project root".into()),
            Component::RootDir | Component::Prefix(_) => return Err("path is absolute".into()),
        }
    }
    if !has_name {
        return Err("path names no file".into());
    }
    Ok(())
}

pub fn resolve(root: &Path, relative: &str) -> Result<PathBuf> {
    validate_relative(relative).map_err(|reason| anyhow!("invalid path '{relative}': {reason}"))?;
    Ok(root.join(relative))
}

pub fn normalize_slashes(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn detect_binary(bytes: &[u8]) -> bool {
    let window = bytes.len().min(BINARY_CHECK_BYTES);
    bytes[..window].contains(&0)
}

/// Reads a text file; a missing file is `None`, binary or non-UTF-8 content is an error.
pub fn read_text(path: &Path) -> Result<Option<String>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    if detect_binary(&bytes) {
        bail!("{} looks like a binary file", path.display());
    }
    let text = String::from_utf8(bytes)
        .map_err(|_| anyhow!("{} is not valid UTF-8 text", path.display()))?;
    Ok(Some(text))
}

pub fn snapshot<'a, I>(paths: I, root: &Path) -> Result<FileSnapshot>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut snapshot = FileSnapshot::new();
    for relative in paths {
        if snapshot.contains_key(relative) {
            continue;
        }
        let content = read_text(&resolve(root, relative)?)?;
        snapshot.insert(relative.to_string(), content);
    }
    Ok(snapshot)
}

/// Writes through a synced sibling temp file that is then renamed over `path`.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating directory {}", dir.display()))?;
            dir
        }
        None => Path::new("."),
    };
    let mut staged = tempfile::Builder::new()
        .prefix(".safepatch-")
        .tempfile_in(dir)
        .with_context(|| format!("staging a write in {}", dir.display()))?;
    staged
        .write_all(data)
        .and_then(|()| staged.as_file().sync_all())
        .with_context(|| format!("staging {}", path.display()))?;
    staged
        .persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
    }
}

pub fn rename_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(dir) = to.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("creating directory {}", dir.display()))?;
    }
    fs::rename(from, to)
        .with_context(|| format!("renaming {} -> {}", from.display(), to.display()))
}

/// Removes empty directories from `start` upward, stopping at the first non-empty
/// directory or at `root` itself.
pub fn prune_empty_dirs(start: &Path, root: &Path) {
    let mut current = start.to_path_buf();
    while current.starts_with(root) && current != root {
        let is_empty = fs::read_dir(&current)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if !is_empty || fs::remove_dir(&current).is_err() {
            break;
        }
        if !current.pop() {
            break;
        }
    }
}

/// Writes every snapshot entry back to disk. Keeps going past failures and reports
/// all of them at the end.
pub fn restore_snapshot(snapshot: &FileSnapshot, root: &Path) -> Result<()> {
    let mut failures = Vec::new();
    for (relative, content) in snapshot {
        let outcome = resolve(root, relative).and_then(|path| match content {
            Some(text) => write_atomic(&path, text.as_bytes()),
            None => {
                if remove_if_exists(&path)? {
                    if let Some(parent) = path.parent() {
                        prune_empty_dirs(parent, root);
                    }
                }
                Ok(())
            }
        });
        if let Err(err) = outcome {
            failures.push(format!("{relative}: {err:#}"));
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        bail!("could not restore {}", failures.join("; "))
    }
}

/// Paths no patch may touch: anything under the state directory plus the
/// configured `protectedPaths` globs.
#[derive(Debug, Default)]
pub struct ProtectedPaths {
    globs: Option<GlobSet>,
    state_prefix: Option<PathBuf>,
}

impl ProtectedPaths {
    /// `state_prefix` is the state directory relative to the project root, `None`
    /// when it lives outside the project.
    pub fn new(patterns: &[String], state_prefix: Option<PathBuf>) -> Result<Self> {
        let globs = if patterns.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for pattern in patterns {
                builder.add(
                    Glob::new(pattern)
                        .with_context(|| format!("invalid protectedPaths entry '{pattern}'"))?,
                );
            }
            Some(builder.build().context("compiling protectedPaths")?)
        };
        Ok(Self {
            globs,
            state_prefix: state_prefix.filter(|prefix| !prefix.as_os_str().is_empty()),
        })
    }

    /// Why `path` is off limits, or `None` when a patch may touch it.
    pub fn refusal(&self, path: &str) -> Option<String> {
        let normalized = normalize_slashes(Path::new(path));
        let clean = normalized.trim_start_matches("./");
        if self
            .state_prefix
            .as_ref()
            .is_some_and(|prefix| Path::new(clean).starts_with(prefix))
        {
            return Some(format!("{path} is inside the state directory"));
        }
        if self.globs.as_ref().is_some_and(|globs| globs.is_match(clean)) {
            return Some(format!("{path} is a protected path"));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn validate_relative_rules() {
        assert!(validate_relative("src/main.rs").is_ok());
        assert!(validate_relative("./src/my file.ts").is_ok());
        assert!(validate_relative("").is_err());
        assert!(validate_relative("/etc/passwd").is_err());
        assert!(validate_relative("src/../../x").is_err());
        assert!(validate_relative(".").is_err());
    }

    #[test]
    fn normalize_slashes_handles_backslashes() {
        assert_eq!(
            normalize_slashes(Path::new("foo\\bar\\baz.txt")),
            "foo/bar/baz.txt"
        );
    }

    #[test]
    fn snapshot_marks_missing_files_absent() {
        let temp = tempdir().expect("temp dir");
        fs::write(temp.path().join("a.txt"), "v1").expect("write");

        let snap = snapshot(["a.txt", "missing.txt", "a.txt"], temp.path()).expect("snapshot");
        assert_eq!(snap.len(), 2);
        assert_eq!(snap["a.txt"].as_deref(), Some("v1"));
        assert_eq!(snap["missing.txt"], None);
    }

    #[test]
    fn snapshot_rejects_binary_files() {
        let temp = tempdir().expect("temp dir");
        fs::write(temp.path().join("blob.bin"), [0u8, 1, 2]).expect("write");
        assert!(snapshot(["blob.bin"], temp.path()).is_err());
    }

    #[test]
    fn restore_recreates_and_removes() {
        let temp = tempdir().expect("temp dir");
        let root = temp.path();
        fs::create_dir_all(root.join("deep/nested")).expect("dirs");
        fs::write(root.join("deep/nested/new.txt"), "created later").expect("write");
        fs::write(root.join("keep.txt"), "changed").expect("write");

        let mut snap = FileSnapshot::new();
        snap.insert("deep/nested/new.txt".into(), None);
        snap.insert("keep.txt".into(), Some("original".into()));
        snap.insert("gone/back.txt".into(), Some("restored".into()));
        restore_snapshot(&snap, root).expect("restore");

        assert!(!root.join("deep").exists(), "empty dirs should be pruned");
        assert_eq!(fs::read_to_string(root.join("keep.txt")).unwrap(), "original");
        assert_eq!(
            fs::read_to_string(root.join("gone/back.txt")).unwrap(),
            "restored"
        );
        assert!(root.exists());
    }

    #[test]
    fn prune_stops_at_non_empty_directory() {
        let temp = tempdir().expect("temp dir");
        let root = temp.path();
        fs::create_dir_all(root.join("a/b/c")).expect("dirs");
        fs::write(root.join("a/sibling.txt"), "x").expect("write");

        prune_empty_dirs(&root.join("a/b/c"), root);
        assert!(!root.join("a/b").exists());
        assert!(root.join("a").exists());
    }

    #[test]
    fn protected_paths_cover_globs_and_state_dir() {
        let protected =
            ProtectedPaths::new(&[".git/**".to_string()], Some(PathBuf::from(".safepatch")))
                .expect("protected paths");
        assert!(protected.refusal(".git/config").is_some());
        assert!(protected.refusal("./.safepatch/transactions/x.yml").is_some());
        assert!(protected.refusal("src\\.safepatch.rs").is_none());
        assert!(protected.refusal("src/git.rs").is_none());

        let open = ProtectedPaths::new(&[], None).expect("protected paths");
        assert!(open.refusal(".git/config").is_none());
        assert!(ProtectedPaths::new(&["[".to_string()], None).is_err());
    }

    #[test]
    fn atomic_write_replaces_and_leaves_no_temp_files() {
        let temp = tempdir().expect("temp dir");
        let target = temp.path().join("nested/out.txt");
        write_atomic(&target, b"first").expect("write");
        write_atomic(&target, b"second").expect("overwrite");
        assert_eq!(fs::read_to_string(&target).unwrap(), "second");
        let names: Vec<_> = fs::read_dir(temp.path().join("nested"))
            .expect("list")
            .map(|entry| entry.expect("entry").file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("out.txt")]);
    }
}
