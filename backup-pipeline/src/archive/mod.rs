//! Archiver: folds a dump directory into a single tar + zstd file and back.

use crate::fs::walker::{walk_directory, WalkOptions};
use crate::utils::{BackupError, Result};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, HeaderMode};

/// Pack `source_dir` into a zstd-compressed tar at `dest_file`.
///
/// Entries are sorted and headers deterministic, with paths relative to
/// `source_dir`.
pub fn compress_dir(source_dir: &Path, dest_file: &Path, level: i32) -> Result<PathBuf> {
    if !source_dir.is_dir() {
        return Err(BackupError::Archive(format!(
            "source is not a directory: {}",
            source_dir.display()
        )));
    }

    let entries = walk_directory(source_dir, &WalkOptions::with_dirs())?;

    let writer = BufWriter::new(File::create(dest_file)?);
    let encoder = zstd::stream::write::Encoder::new(writer, level)?;
    let mut builder = Builder::new(encoder);
    builder.mode(HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    for entry in &entries {
        if entry.is_dir {
            builder.append_dir(&entry.relative_path, &entry.path)?;
        } else {
            builder.append_path_with_name(&entry.path, &entry.relative_path)?;
        }
    }

    let encoder = builder.into_inner()?;
    let writer = encoder.finish()?;
    writer
        .into_inner()
        .map_err(|e| BackupError::Io(e.into_error()))?
        .sync_all()?;

    tracing::debug!(
        source = %source_dir.display(),
        archive = %dest_file.display(),
        entries = entries.len(),
        "Archive written"
    );
    Ok(dest_file.to_path_buf())
}

/// Unpack an archive produced by [`compress_dir`] into `dest_dir`.
///
/// Entries escaping `dest_dir` are refused by the unpacker. The rest of the
/// compressed stream is drained so truncation is reported even when the tar
/// end marker was already read.
pub fn extract_archive(archive_file: &Path, dest_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dest_dir)?;

    let reader = BufReader::new(File::open(archive_file)?);
    let decoder = zstd::stream::read::Decoder::with_buffer(reader)
        .map_err(|e| BackupError::Archive(format!("invalid zstd stream: {}", e)))?;
    let mut archive = Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive
        .unpack(dest_dir)
        .map_err(|e| BackupError::Archive(format!("failed to unpack {}: {}", archive_file.display(), e)))?;

    io::copy(&mut archive.into_inner(), &mut io::sink())
        .map_err(|e| BackupError::Archive(format!("corrupt archive {}: {}", archive_file.display(), e)))?;

    Ok(dest_dir.to_path_buf())
}

/// [`compress_dir`] on the blocking pool.
pub async fn compress(source_dir: PathBuf, dest_file: PathBuf, level: i32) -> Result<PathBuf> {
    tokio::task::spawn_blocking(move || compress_dir(&source_dir, &dest_file, level))
        .await
        .map_err(|e| BackupError::Archive(format!("compression task failed: {}", e)))?
}

/// [`extract_archive`] on the blocking pool.
pub async fn extract(archive_file: PathBuf, dest_dir: PathBuf) -> Result<PathBuf> {
    tokio::task::spawn_blocking(move || extract_archive(&archive_file, &dest_dir))
        .await
        .map_err(|e| BackupError::Archive(format!("extraction task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dump_fixture(root: &Path) {
        fs::create_dir_all(root.join("shop")).unwrap();
        fs::create_dir_all(root.join("admin")).unwrap();
        fs::write(root.join("shop/orders.bson.gz"), vec![42u8; 10_000]).unwrap();
        fs::write(root.join("shop/orders.metadata.json.gz"), b"{\"indexes\":[]}").unwrap();
        fs::write(root.join("admin/system.version.bson.gz"), b"v").unwrap();
        fs::write(root.join("prelude.json"), b"{}").unwrap();
    }

    fn relative_files(root: &Path) -> Vec<(String, Vec<u8>)> {
        walk_directory(root, &WalkOptions::files_only())
            .unwrap()
            .into_iter()
            .map(|f| {
                (
                    f.relative_path.to_string_lossy().into_owned(),
                    fs::read(&f.path).unwrap(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_compress_then_extract_reproduces_tree() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("full_backup_1");
        dump_fixture(&source);
        let archive_path = tmp.path().join("full_backup_1.tar.zst");
        let restored = tmp.path().join("restored");

        compress(source.clone(), archive_path.clone(), 3).await.unwrap();
        extract(archive_path, restored.clone()).await.unwrap();

        assert_eq!(relative_files(&source), relative_files(&restored));
        assert!(restored.join("admin").is_dir());
    }

    #[test]
    fn test_archives_are_deterministic() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("dump");
        dump_fixture(&source);
        let a = tmp.path().join("a.tar.zst");
        let b = tmp.path().join("b.tar.zst");

        compress_dir(&source, &a, 3).unwrap();
        compress_dir(&source, &b, 3).unwrap();
        assert_eq!(fs::read(&a).unwrap(), fs::read(&b).unwrap());
    }

    #[test]
    fn test_truncated_archive_fails() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("dump");
        dump_fixture(&source);
        let archive_path = tmp.path().join("dump.tar.zst");
        compress_dir(&source, &archive_path, 3).unwrap();

        let bytes = fs::read(&archive_path).unwrap();
        fs::write(&archive_path, &bytes[..bytes.len() / 2]).unwrap();

        let err = extract_archive(&archive_path, &tmp.path().join("out")).unwrap_err();
        assert!(matches!(err, BackupError::Archive(_)));
    }

    #[test]
    fn test_missing_source_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = compress_dir(&tmp.path().join("nope"), &tmp.path().join("x.tar.zst"), 3).unwrap_err();
        assert!(matches!(err, BackupError::Archive(_)));
    }
}
