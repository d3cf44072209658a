use crate::common::{FaceGateError, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Replaces `path` with `bytes` so readers see either the old or the new file, never a mix.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| persistence(path, "create directory for", e))?;

    let tmp = tmp_path(path);
    let written = File::create(&tmp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(persistence(path, "write", e));
    }

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(persistence(path, "replace", e));
    }

    tracing::debug!("Wrote {} bytes to {}", bytes.len(), path.display());
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn persistence(path: &Path, action: &str, err: std::io::Error) -> FaceGateError {
    FaceGateError::Persistence(format!("Failed to {} {}: {}", action, path.display(), err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn replaces_existing_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("blob.bin");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn failure_is_a_persistence_error() {
        let dir = TempDir::new().unwrap();
        // A directory cannot be replaced by a file.
        let target = dir.path().join("occupied");
        fs::create_dir_all(target.join("child")).unwrap();

        let err = write_atomic(&target, b"data").unwrap_err();
        assert!(matches!(err, FaceGateError::Persistence(_)));
    }
}
