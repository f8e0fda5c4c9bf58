use std::path::{Path, PathBuf};

use crossbeam::channel::Sender;
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

/// Walks `root` and sends every non-hidden file whose extension is in
/// `extensions` (lowercase, no dot). Unreadable entries are logged and
/// skipped. Returns the number of files sent.
pub fn scan_directory(root: &Path, extensions: &[String], tx: Sender<PathBuf>) -> usize {
    let walker = WalkDir::new(root).into_iter();
    let mut sent = 0;

    for entry in walker.filter_entry(|e| e.depth() == 0 || !is_hidden(e)) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() || !has_extension(entry.path(), extensions) {
            continue;
        }
        // A closed channel means the workers are gone; stop walking.
        if tx.send(entry.into_path()).is_err() {
            break;
        }
        sent += 1;
    }
    sent
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name()
         .to_str()
         .map(|s| s.starts_with('.'))
         .unwrap_or(false)
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.iter().any(|wanted| wanted.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;
    use std::fs;
    use tempfile::TempDir;

    fn scan(root: &Path, extensions: &[&str]) -> Vec<PathBuf> {
        let extensions: Vec<String> = extensions.iter().map(|s| s.to_string()).collect();
        let (tx, rx) = unbounded();
        let sent = scan_directory(root, &extensions, tx);
        let mut paths: Vec<PathBuf> = rx.iter().collect();
        assert_eq!(sent, paths.len());
        paths.sort();
        paths
    }

    #[test]
    fn test_filters_by_extension_recursively() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("2024-01-01").join("batch");
        fs::create_dir_all(&nested).unwrap();
        fs::write(dir.path().join("a.png"), b"").unwrap();
        fs::write(nested.join("b.PNG"), b"").unwrap();
        fs::write(nested.join("notes.txt"), b"").unwrap();

        let found = scan(dir.path(), &["png"]);
        assert_eq!(found, vec![nested.join("b.PNG"), dir.path().join("a.png")]);
    }

    #[test]
    fn test_skips_hidden_entries_below_root() {
        let dir = TempDir::new().unwrap();
        let hidden = dir.path().join(".thumbnails");
        fs::create_dir(&hidden).unwrap();
        fs::write(hidden.join("c.png"), b"").unwrap();
        fs::write(dir.path().join(".d.png"), b"").unwrap();
        fs::write(dir.path().join("e.png"), b"").unwrap();

        assert_eq!(scan(dir.path(), &["png"]), vec![dir.path().join("e.png")]);
    }

    #[test]
    fn test_missing_root_sends_nothing() {
        assert!(scan(Path::new("/no/such/root"), &["png"]).is_empty());
    }
}
