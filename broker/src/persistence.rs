//! Atomic sidecar file writes: write to a temp file in the target
//! directory, fsync, then rename over the destination, so a crash never
//! leaves a torn file behind.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

/// Atomically overwrite `path` with `contents`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

/// Read `path` if it exists, returning `None` if it doesn't.
pub fn read_if_exists(path: &Path) -> anyhow::Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_then_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sidecar.json");
        write_atomic(&path, b"{\"a\":1}").unwrap();
        let contents = read_if_exists(&path).unwrap().unwrap();
        assert_eq!(contents, b"{\"a\":1}");
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        assert!(read_if_exists(&path).unwrap().is_none());
    }
}
