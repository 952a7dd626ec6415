//! Archive extraction for every format the fetcher recognises (§6):
//! `.tar`, `.tar.gz`/`.gz`, `.tar.bz2`/`.bz2`, `.tar.xz`, `.tar.zst`/`.zst`,
//! `.zip`, and `.deb` (an `ar` archive containing `control.tar.*` +
//! `data.tar.*` + `debian-binary`, extracted into `control/`/`data/`).

use std::fs::File;
use std::io::Read;
use std::path::Path;

use color_eyre::{Result, eyre::Context};

/// Whether `path`'s extension identifies a format we can extract.
pub fn is_supported(path: &Path) -> bool {
    kind_of(path).is_some()
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Kind {
    Tar,
    TarGz,
    TarBz2,
    TarXz,
    TarZst,
    Zip,
    Deb,
}

fn kind_of(path: &Path) -> Option<Kind> {
    let name = path.file_name()?.to_str()?.to_ascii_lowercase();
    if name.ends_with(".tar") {
        Some(Kind::Tar)
    } else if name.ends_with(".tar.gz") || name.ends_with(".gz") {
        Some(Kind::TarGz)
    } else if name.ends_with(".tar.bz2") || name.ends_with(".bz2") {
        Some(Kind::TarBz2)
    } else if name.ends_with(".tar.xz") {
        Some(Kind::TarXz)
    } else if name.ends_with(".tar.zst") || name.ends_with(".zst") {
        Some(Kind::TarZst)
    } else if name.ends_with(".zip") {
        Some(Kind::Zip)
    } else if name.ends_with(".deb") {
        Some(Kind::Deb)
    } else {
        None
    }
}

/// Extract `src` into directory `dst`, which must already exist.
///
/// Blocking; callers running on an async scheduler should offload this to
/// a worker thread (e.g. `spawn_blocking`).
pub fn extract(src: &Path, dst: &Path) -> Result<()> {
    let kind = kind_of(src)
        .ok_or_else(|| color_eyre::eyre::eyre!("unsupported archive extension: {src:?}"))?;
    match kind {
        Kind::Tar => extract_tar(File::open(src).context("open archive")?, dst),
        Kind::TarGz => {
            let file = File::open(src).context("open archive")?;
            extract_tar(flate2::read::GzDecoder::new(file), dst)
        }
        Kind::TarBz2 => {
            let file = File::open(src).context("open archive")?;
            extract_tar(bzip2::read::BzDecoder::new(file), dst)
        }
        Kind::TarXz => {
            let file = File::open(src).context("open archive")?;
            extract_tar(xz2::read::XzDecoder::new(file), dst)
        }
        Kind::TarZst => {
            let file = File::open(src).context("open archive")?;
            let decoder = zstd::stream::read::Decoder::new(file).context("init zstd decoder")?;
            extract_tar(decoder, dst)
        }
        Kind::Zip => extract_zip(src, dst),
        Kind::Deb => extract_deb(src, dst),
    }
}

/// Extract a tar stream. Ownership normalisation to `0/0`/`root/root` is
/// `dpkg-buildpackage`'s job when it builds the final `.deb` from the
/// `debian/`+`src/` tree the materialiser produces; extraction here
/// simply unpacks whatever the upstream archive contains, verbatim.
fn extract_tar(reader: impl Read, dst: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_unpack_xattrs(false);
    // A dangling symlink inside the archive must not abort extraction;
    // tar-rs's unpack() already skips re-validating link targets, so the
    // only failure mode left is genuine I/O errors, which we propagate.
    archive.unpack(dst).context("unpack tar archive")?;
    Ok(())
}

fn extract_zip(src: &Path, dst: &Path) -> Result<()> {
    let file = File::open(src).context("open zip archive")?;
    let mut archive = zip::ZipArchive::new(file).context("read zip archive")?;
    archive.extract(dst).context("unpack zip archive")?;
    Ok(())
}

/// `.deb` files are `ar` archives of `debian-binary`, `control.tar.*`, and
/// `data.tar.*`. We unpack the two tars into `control/` and `data/`
/// subdirectories of `dst`.
fn extract_deb(src: &Path, dst: &Path) -> Result<()> {
    let file = File::open(src).context("open deb archive")?;
    let mut archive = ar::Archive::new(file);

    while let Some(entry) = archive.next_entry() {
        let mut entry = entry.context("read ar entry")?;
        let name = String::from_utf8_lossy(entry.header().identifier()).to_string();

        let mut buf = Vec::new();
        entry.read_to_end(&mut buf).context("read ar entry body")?;

        if name.starts_with("control.tar") {
            let subdir = dst.join("control");
            std::fs::create_dir_all(&subdir).context("create control dir")?;
            extract_tar_bytes(&name, &buf, &subdir)?;
        } else if name.starts_with("data.tar") {
            let subdir = dst.join("data");
            std::fs::create_dir_all(&subdir).context("create data dir")?;
            extract_tar_bytes(&name, &buf, &subdir)?;
        }
        // debian-binary is intentionally not extracted: it carries no
        // useful information for a source package materialiser.
    }
    Ok(())
}

fn extract_tar_bytes(member_name: &str, bytes: &[u8], dst: &Path) -> Result<()> {
    let cursor = std::io::Cursor::new(bytes);
    if member_name.ends_with(".gz") {
        extract_tar(flate2::read::GzDecoder::new(cursor), dst)
    } else if member_name.ends_with(".xz") {
        extract_tar(xz2::read::XzDecoder::new(cursor), dst)
    } else if member_name.ends_with(".zst") {
        extract_tar(zstd::stream::read::Decoder::new(cursor).context("init zstd decoder")?, dst)
    } else if member_name.ends_with(".bz2") {
        extract_tar(bzip2::read::BzDecoder::new(cursor), dst)
    } else {
        extract_tar(cursor, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_supported_extensions() {
        for name in [
            "a.tar", "a.tar.gz", "a.gz", "a.tar.bz2", "a.bz2", "a.tar.xz", "a.tar.zst", "a.zst",
            "a.zip", "a.deb",
        ] {
            assert!(is_supported(Path::new(name)), "{name} should be supported");
        }
    }

    #[test]
    fn rejects_unknown_extensions() {
        assert!(!is_supported(Path::new("a.exe")));
        assert!(!is_supported(Path::new("a")));
    }

    #[test]
    fn round_trips_a_plain_tar() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("x.tar");
        {
            let file = File::create(&tar_path).unwrap();
            let mut builder = tar::Builder::new(file);
            let data = b"hello world";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, "hello.txt", &data[..]).unwrap();
            builder.finish().unwrap();
        }

        let out = dir.path().join("out");
        std::fs::create_dir(&out).unwrap();
        extract(&tar_path, &out).unwrap();
        let content = std::fs::read(out.join("hello.txt")).unwrap();
        assert_eq!(content, b"hello world");
    }
}
