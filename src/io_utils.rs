use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

/// Sibling path used while a file is being replaced.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("state"));
    name.push(".tmp");
    path.with_file_name(name)
}

/// Replace `path` with `contents`.
///
/// The bytes are written to a temporary sibling, synced, then renamed over
/// the target so readers never observe a truncated file.
pub fn replace_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = temp_path(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

/// Save data to a file using JSON serialization, replacing it atomically.
pub fn save_to_file<T: Serialize>(data: &T, path: &Path) -> std::io::Result<()> {
    let mut bytes = serde_json::to_vec_pretty(data)?;
    bytes.push(b'\n');
    replace_file(path, &bytes)
}

/// Load data from a file using JSON deserialization
pub fn load_from_file<T: for<'a> Deserialize<'a>>(path: &Path) -> std::io::Result<T> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let data = serde_json::from_reader(reader)?;
    Ok(data)
}

/// Like [`load_from_file`], but a missing file is `Ok(None)`.
pub fn load_optional<T: for<'a> Deserialize<'a>>(path: &Path) -> std::io::Result<Option<T>> {
    match load_from_file(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Append one line to a file, creating it if needed.
pub fn append_line(path: &Path, line: &str, sync: bool) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    if sync {
        file.sync_data()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn test_save_and_load_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        let sample = Sample {
            name: "x".to_string(),
            count: 3,
        };

        save_to_file(&sample, &path).unwrap();
        let loaded: Sample = load_from_file(&path).unwrap();

        assert_eq!(loaded, sample);
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_load_optional_missing() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Option<Sample> = load_optional(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_replace_file_overwrites_whole_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.txt");
        std::fs::write(&path, "a much longer previous body\n").unwrap();

        replace_file(&path, b"short\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "short\n");
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_append_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lines.txt");
        append_line(&path, "a", false).unwrap();
        append_line(&path, "b", true).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\n");
    }
}
