//! Zip packaging and checksums for export artifacts

use crate::errors::{AppError, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

/// File name component of `path`
pub fn entry_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| AppError::Archive {
            message: format!("no file name in {}", path.display()),
        })
}

/// Write `entries` into a deflated zip at `dest`.
///
/// Entries carry a fixed timestamp so identical inputs give identical archives.
pub fn write_zip(dest: &Path, entries: &[PathBuf]) -> Result<()> {
    let mut zip = ZipWriter::new(BufWriter::new(File::create(dest)?));

    for entry in entries {
        let size = std::fs::metadata(entry)?.len();
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(DateTime::default())
            .large_file(size >= u64::from(u32::MAX));

        zip.start_file(entry_name(entry)?, options)?;
        let mut input = File::open(entry)?;
        io::copy(&mut input, &mut zip)?;
    }

    zip.finish()?.flush()?;
    Ok(())
}

/// Hex sha256 of a file
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut file = File::open(path)?;
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_write_zip_contains_entries() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("study.csv");
        let b = dir.path().join("signal.csv");
        std::fs::write(&a, "id,name\n1,x\n").unwrap();
        std::fs::write(&b, "id,signal\n").unwrap();

        let dest = dir.path().join("out.zip");
        write_zip(&dest, &[a, b]).unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
        let mut text = String::new();
        archive.by_name("study.csv").unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "id,name\n1,x\n");
    }

    #[test]
    fn test_zip_is_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("assay.csv");
        std::fs::write(&a, "id\n1\n2\n").unwrap();

        let first = dir.path().join("first.zip");
        let second = dir.path().join("second.zip");
        write_zip(&first, &[a.clone()]).unwrap();
        write_zip(&second, &[a]).unwrap();

        assert_eq!(std::fs::read(first).unwrap(), std::fs::read(second).unwrap());
    }

    #[test]
    fn test_sha256_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
