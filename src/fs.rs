//! Filesystem operations tailored to `ops2deb`.
//!
//! Inside this module we refer to `std::fs`/`tokio::fs` by their fully
//! qualified paths to make it clear what is actually doing the IO.

use std::path::{Path, PathBuf};

use color_eyre::{Result, eyre::Context};
use futures::{Stream, TryStreamExt};
use sha2::{Digest, Sha256};
use tap::{Pipe, TapFallible};
use tokio::task::spawn_blocking;
use tracing::{debug, instrument, trace};

/// The default level of concurrency used for `ops2deb` filesystem and
/// network operations, absent an explicit `--workers` override.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Create the directory and all its parents, if they don't already exist.
#[instrument]
pub async fn create_dir_all(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create dir: {dir:?}"))
        .tap_ok(|_| trace!(?dir, "create directory"))
}

/// Remove the directory and all its contents, ignoring a missing directory.
#[instrument]
pub async fn remove_dir_all(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(format!("remove directory: {path:?}")),
    }
    .tap_ok(|_| trace!(?path, "removed directory"))
}

/// Walk files in a directory recursively.
///
/// Only emits regular files; symlinks and directories are skipped.
#[instrument]
pub fn walk_files(root: &Path) -> impl Stream<Item = Result<PathBuf>> + Unpin {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<PathBuf>>(32);
    let root = root.to_path_buf();

    spawn_blocking(move || {
        for entry in jwalk::WalkDir::new(&root).skip_hidden(false) {
            let entry = match entry.with_context(|| format!("walk files in {root:?}")) {
                Ok(entry) => entry,
                Err(err) => {
                    let _ = tx.blocking_send(Err(err));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if tx.blocking_send(Ok(entry.path())).is_err() {
                return;
            }
        }
    });

    tokio_stream::wrappers::ReceiverStream::new(rx).pipe(Box::pin)
}

/// Recursively copy the contents of `src` to `dst`, preserving relative
/// paths and the executable bit.
#[instrument]
pub async fn copy_dir(src: &Path, dst: &Path) -> Result<u64> {
    copy_dir_with_concurrency(DEFAULT_CONCURRENCY, src, dst).await
}

/// Recursively copy the contents of `src` to `dst` with the given bound on
/// concurrently in-flight copies. Returns the total number of bytes copied.
#[instrument]
pub async fn copy_dir_with_concurrency(concurrency: usize, src: &Path, dst: &Path) -> Result<u64> {
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();
    walk_files(&src)
        .map_ok(|src_file| {
            let src = src.clone();
            let dst = dst.clone();
            async move {
                let rel = src_file
                    .strip_prefix(&src)
                    .with_context(|| format!("make {src_file:?} relative to {src:?}"))?;
                let dst_file = dst.join(rel);
                copy_file(&src_file, &dst_file)
                    .await
                    .with_context(|| format!("copy {src_file:?} to {dst_file:?}"))
            }
        })
        .try_buffer_unordered(concurrency)
        .try_fold(0u64, |total, copied| async move { Ok(total + copied) })
        .await
}

/// Copy a single file, creating the destination's parent directory first and
/// carrying over the executable bit.
#[instrument]
pub async fn copy_file(src: &Path, dst: &Path) -> Result<u64> {
    if let Some(parent) = dst.parent() {
        create_dir_all(parent).await.context("create parent dir")?;
    }
    let bytes = tokio::fs::copy(src, dst).await.context("copy file")?;
    if is_executable(src).await {
        set_executable(dst, true).await?;
    }
    trace!(?src, ?dst, bytes, "copy file");
    Ok(bytes)
}

/// Read the file content from disk, returning `Ok(None)` if it doesn't exist.
#[instrument]
pub async fn read_buffered(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(buf) => Ok(Some(buf)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Write the provided file content to disk, creating the parent directory
/// if it doesn't already exist.
#[instrument(skip(content))]
pub async fn write(path: &Path, content: impl AsRef<[u8]>) -> Result<()> {
    let content = content.as_ref();
    if let Some(parent) = path.parent() {
        create_dir_all(parent).await.context("create parent dir")?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("write file: {path:?}"))
        .tap_ok(|_| trace!(?path, bytes = content.len(), "write file"))
}

/// Atomically replace `dst` with `src` by renaming, falling back to a
/// remove-then-rename when the destination already exists and is a
/// directory (`tokio::fs::rename` already overwrites files on Unix).
#[instrument]
pub async fn rename(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        create_dir_all(parent).await.context("create parent dir")?;
    }
    tokio::fs::rename(src, dst)
        .await
        .with_context(|| format!("rename {src:?} -> {dst:?}"))
        .tap_ok(|_| trace!(?src, ?dst, "rename"))
}

/// Return whether the path exists.
#[instrument]
pub async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Return whether the file at `path` has any executable bit set.
#[instrument]
pub async fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        tokio::fs::metadata(path)
            .await
            .map(|meta| meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        false
    }
}

/// Mark the file at `path` as executable (a no-op on non-Unix targets).
#[instrument]
pub async fn set_executable(path: &Path, executable: bool) -> Result<()> {
    #[cfg(unix)]
    if executable {
        use std::os::unix::fs::PermissionsExt as _;
        let metadata = tokio::fs::metadata(path).await.context("get metadata")?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(permissions.mode() | 0o111);
        tokio::fs::set_permissions(path, permissions)
            .await
            .context("set permissions")?;
    }
    #[cfg(not(unix))]
    let _ = (path, executable);
    Ok(())
}

/// Compute the SHA-256 digest of a file, streaming it in fixed size chunks
/// so large archives don't need to be fully buffered in memory.
#[instrument]
pub async fn sha256_file(path: &Path) -> Result<String> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open file: {path:?}"))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let len = file.read(&mut buf).await.context("read chunk")?;
        if len == 0 {
            break;
        }
        hasher.update(&buf[..len]);
    }
    let digest = hex::encode(hasher.finalize());
    debug!(?path, %digest, "computed sha256");
    Ok(digest)
}

/// Synchronously compute the SHA-256 digest of a byte slice.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Compute the SHA-256 digest of a UTF-8 string (used to derive the
/// content-addressed cache key for a fetch URL).
pub fn sha256_str(value: &str) -> String {
    sha256_bytes(value.as_bytes())
}

/// Mirror `src`'s tree into `dst`, merging into an existing destination
/// rather than replacing it. Symlinks are recreated as symlinks, not
/// dereferenced, so a dangling symlink inside `src` is copied as-is
/// instead of failing the sync.
#[instrument]
pub async fn sync_tree(src: &Path, dst: &Path) -> Result<()> {
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();
    spawn_blocking(move || sync_tree_blocking(&src, &dst))
        .await
        .context("join tree sync task")?
}

fn sync_tree_blocking(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst).with_context(|| format!("create dir: {dst:?}"))?;
    for entry in std::fs::read_dir(src).with_context(|| format!("read dir: {src:?}"))? {
        let entry = entry.with_context(|| format!("read dir entry in {src:?}"))?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry
            .file_type()
            .with_context(|| format!("stat {src_path:?}"))?;

        if file_type.is_symlink() {
            let target = std::fs::read_link(&src_path).with_context(|| format!("read link {src_path:?}"))?;
            let _ = std::fs::remove_file(&dst_path);
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, &dst_path)
                .with_context(|| format!("symlink {dst_path:?} -> {target:?}"))?;
            #[cfg(not(unix))]
            std::fs::copy(&target, &dst_path).with_context(|| format!("copy link target for {dst_path:?}"))?;
        } else if file_type.is_dir() {
            sync_tree_blocking(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path)
                .with_context(|| format!("copy {src_path:?} to {dst_path:?}"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn sync_tree_copies_regular_files() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        tokio::fs::create_dir_all(src.join("sub")).await.unwrap();
        tokio::fs::write(src.join("sub/a.txt"), b"hello").await.unwrap();

        sync_tree(&src, &dst).await.unwrap();
        assert_eq!(tokio::fs::read(dst.join("sub/a.txt")).await.unwrap(), b"hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sync_tree_does_not_abort_on_dangling_symlink() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        tokio::fs::create_dir_all(&src).await.unwrap();
        std::os::unix::fs::symlink(src.join("missing-target"), src.join("broken")).unwrap();

        sync_tree(&src, &dst).await.unwrap();
        let meta = tokio::fs::symlink_metadata(dst.join("broken")).await.unwrap();
        assert!(meta.file_type().is_symlink());
    }
}
