//! Archive codec: creation and safe extraction (zip/tar/tar.gz).
//!
//! Creation writes entries under their display names, in input order, and
//! applies ZipCrypto encryption through the codec API when a password is
//! present; the password never appears on a command line.
//!
//! Extraction defends against common archive attacks:
//! - Path traversal (`../`, absolute paths, Windows drive prefixes)
//! - Symlink/hardlink entries that escape the extraction directory
//! - Resource exhaustion (too many files / too much total content)

use std::{
    fs,
    io::Read,
    path::{Component, Path, PathBuf},
};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::Archive;
use zip::{unstable::write::FileOptionsExt, write::FileOptions, CompressionMethod, ZipArchive, ZipWriter};

use crate::{errors::Error, registry::ArchiveFormat, Result};

/// Called after each entry is written: (entries done, entries total).
pub type EntryProgress<'a> = &'a mut dyn FnMut(usize, usize);

pub fn detect_format(file_name: &str) -> Option<ArchiveFormat> {
    let lower = file_name.to_lowercase();
    if lower.ends_with(".zip") {
        return Some(ArchiveFormat::Zip);
    }
    if lower.ends_with(".tar") {
        return Some(ArchiveFormat::Tar);
    }
    if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        return Some(ArchiveFormat::TarGz);
    }
    None
}

/// Create an archive at `dest` from `(path, entry name)` pairs, in order.
///
/// `password` is only honored for ZIP; callers gate on
/// [`ArchiveFormat::supports_password`].
pub fn create_archive(
    format: ArchiveFormat,
    entries: &[(PathBuf, String)],
    password: Option<&str>,
    dest: &Path,
    on_entry: EntryProgress<'_>,
) -> Result<()> {
    match format {
        ArchiveFormat::Zip => create_zip(entries, password, dest, on_entry),
        ArchiveFormat::Tar => {
            let file = fs::File::create(dest)?;
            create_tar_writer(entries, file, on_entry)?;
            Ok(())
        }
        ArchiveFormat::TarGz => {
            let file = fs::File::create(dest)?;
            let enc = GzEncoder::new(file, Compression::default());
            let enc = create_tar_writer(entries, enc, on_entry)?;
            enc.finish()?;
            Ok(())
        }
    }
}

fn create_zip(
    entries: &[(PathBuf, String)],
    password: Option<&str>,
    dest: &Path,
    on_entry: EntryProgress<'_>,
) -> Result<()> {
    let file = fs::File::create(dest)?;
    let mut zw = ZipWriter::new(file);

    let mut options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    if let Some(pw) = password {
        options = options.with_deprecated_encryption(pw.as_bytes());
    }

    let total = entries.len();
    for (i, (path, name)) in entries.iter().enumerate() {
        zw.start_file(name.as_str(), options)
            .map_err(|e| Error::Archive(format!("zip write error: {e}")))?;
        let mut src = fs::File::open(path)?;
        std::io::copy(&mut src, &mut zw)?;
        on_entry(i + 1, total);
    }

    zw.finish()
        .map_err(|e| Error::Archive(format!("zip finalize error: {e}")))?;
    Ok(())
}

fn create_tar_writer<W: std::io::Write>(
    entries: &[(PathBuf, String)],
    writer: W,
    on_entry: EntryProgress<'_>,
) -> Result<W> {
    let mut builder = tar::Builder::new(writer);
    let total = entries.len();
    for (i, (path, name)) in entries.iter().enumerate() {
        builder.append_path_with_name(path, name)?;
        on_entry(i + 1, total);
    }
    let writer = builder.into_inner()?;
    Ok(writer)
}

#[derive(Clone, Copy, Debug)]
pub struct ExtractLimits {
    /// Maximum number of regular files extracted.
    pub max_files: usize,
    /// Maximum total bytes extracted across all regular files.
    pub max_total_bytes: u64,
    /// Maximum bytes extracted per file.
    pub max_file_bytes: u64,
}

impl Default for ExtractLimits {
    fn default() -> Self {
        Self {
            max_files: 200,
            max_total_bytes: 2 * 1024 * 1024 * 1024, // 2GiB
            max_file_bytes: 512 * 1024 * 1024,       // 512MB per file
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExtractReport {
    pub extracted_files: Vec<PathBuf>, // relative paths
    pub total_bytes: u64,
}

/// Extract `archive_path` into `dest_dir`, which is created if missing.
///
/// The format is inferred from `file_name` (the display name, since the
/// staging path carries no meaningful extension).
pub fn extract_archive(
    archive_path: &Path,
    file_name: &str,
    dest_dir: &Path,
    password: Option<&str>,
    limits: ExtractLimits,
) -> Result<ExtractReport> {
    fs::create_dir_all(dest_dir)?;

    match detect_format(file_name) {
        Some(ArchiveFormat::Zip) => extract_zip(archive_path, dest_dir, password, limits),
        Some(ArchiveFormat::Tar) => {
            let f = fs::File::open(archive_path)?;
            extract_tar_reader(f, dest_dir, limits)
        }
        Some(ArchiveFormat::TarGz) => {
            let f = fs::File::open(archive_path)?;
            extract_tar_reader(GzDecoder::new(f), dest_dir, limits)
        }
        None => Err(Error::Archive(format!(
            "unknown archive type for file: {file_name}"
        ))),
    }
}

fn extract_zip(
    archive_path: &Path,
    dest_dir: &Path,
    password: Option<&str>,
    limits: ExtractLimits,
) -> Result<ExtractReport> {
    let f = fs::File::open(archive_path)?;
    let mut zip = ZipArchive::new(f).map_err(|e| Error::Archive(format!("zip error: {e}")))?;

    let mut report = ExtractReport::default();
    let mut file_count = 0usize;
    let mut total = 0u64;

    for i in 0..zip.len() {
        let entry = match password {
            Some(pw) => match zip
                .by_index_decrypt(i, pw.as_bytes())
                .map_err(|e| Error::Archive(format!("zip error: {e}")))?
            {
                Ok(entry) => entry,
                Err(_) => {
                    return Err(Error::Archive("wrong archive password".to_string()));
                }
            },
            None => zip
                .by_index(i)
                .map_err(|e| Error::Archive(format!("zip error: {e}")))?,
        };

        let name = entry.name().replace('\\', "/");
        if name.is_empty() {
            continue;
        }

        // Zip symlinks are commonly encoded via unix mode bits. Disallow them.
        if let Some(mode) = entry.unix_mode() {
            let kind = mode & 0o170000;
            if kind == 0o120000 {
                return Err(Error::Archive(format!(
                    "archive contains symlink entry: {name}"
                )));
            }
        }

        let rel = sanitize_rel_path(Path::new(&name))?;
        let out_path = dest_dir.join(&rel);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        file_count += 1;
        if file_count > limits.max_files {
            return Err(Error::Archive(format!(
                "archive exceeds max_files limit ({})",
                limits.max_files
            )));
        }

        let size = entry.size();
        if size > limits.max_file_bytes {
            return Err(Error::Archive(format!(
                "archive file too large: {} bytes (max {}) for {name}",
                size, limits.max_file_bytes
            )));
        }
        if total.saturating_add(size) > limits.max_total_bytes {
            return Err(Error::Archive(format!(
                "archive exceeds max_total_bytes limit ({})",
                limits.max_total_bytes
            )));
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = fs::File::create(&out_path)?;
        // Enforce an upper bound even if zip metadata lies.
        let mut limited = entry.take(limits.max_file_bytes + 1);
        let copied = std::io::copy(&mut limited, &mut out).map_err(|e| {
            // A wrong ZipCrypto password that slips past the check byte
            // surfaces here as a checksum failure.
            Error::Archive(format!("failed to read archive entry {name}: {e}"))
        })?;
        if copied > limits.max_file_bytes {
            return Err(Error::Archive(format!(
                "archive entry exceeds max_file_bytes while extracting: {name}"
            )));
        }
        total += copied;

        report.extracted_files.push(rel);
        report.total_bytes = total;
    }

    Ok(report)
}

fn extract_tar_reader<R: Read>(
    r: R,
    dest_dir: &Path,
    limits: ExtractLimits,
) -> Result<ExtractReport> {
    let mut archive = Archive::new(r);
    let mut report = ExtractReport::default();
    let mut file_count = 0usize;
    let mut total = 0u64;

    for entry in archive.entries()? {
        let entry = entry?;
        let entry_type = entry.header().entry_type();

        // Disallow symlinks/hardlinks/devices/etc.
        if !entry_type.is_file() && !entry_type.is_dir() {
            let p = entry
                .path()
                .ok()
                .and_then(|p| p.to_str().map(|s| s.to_string()))
                .unwrap_or_else(|| "<unknown>".to_string());
            return Err(Error::Archive(format!(
                "archive contains non-file/non-dir entry: {p}"
            )));
        }

        let rel = sanitize_rel_path(&entry.path()?)?;
        let out_path = dest_dir.join(&rel);

        if entry_type.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        file_count += 1;
        if file_count > limits.max_files {
            return Err(Error::Archive(format!(
                "archive exceeds max_files limit ({})",
                limits.max_files
            )));
        }

        let size = entry.header().size().unwrap_or(0);
        if size > limits.max_file_bytes {
            return Err(Error::Archive(format!(
                "archive file too large: {} bytes (max {}) for {}",
                size,
                limits.max_file_bytes,
                rel.display()
            )));
        }
        if total.saturating_add(size) > limits.max_total_bytes {
            return Err(Error::Archive(format!(
                "archive exceeds max_total_bytes limit ({})",
                limits.max_total_bytes
            )));
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = fs::File::create(&out_path)?;
        let mut limited = entry.take(limits.max_file_bytes + 1);
        let copied = std::io::copy(&mut limited, &mut out)?;
        if copied > limits.max_file_bytes {
            return Err(Error::Archive(format!(
                "archive entry exceeds max_file_bytes while extracting: {}",
                rel.display()
            )));
        }
        total += copied;

        report.extracted_files.push(rel);
        report.total_bytes = total;
    }

    Ok(report)
}

fn sanitize_rel_path(p: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::Normal(os) => out.push(os),
            Component::ParentDir => {
                return Err(Error::Archive(format!(
                    "archive contains path traversal: {}",
                    p.display()
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::Archive(format!(
                    "archive contains absolute path: {}",
                    p.display()
                )));
            }
        }
    }

    if out.as_os_str().is_empty() {
        return Err(Error::Archive("archive contains empty path".to_string()));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tmp(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis();
        let pid = std::process::id();
        let dir = PathBuf::from(format!("/tmp/{prefix}-{pid}-{ts}"));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_inputs(base: &Path) -> Vec<(PathBuf, String)> {
        let a = base.join("staged_a");
        let b = base.join("staged_b");
        fs::write(&a, vec![b'a'; 100]).unwrap();
        fs::write(&b, vec![b'b'; 200]).unwrap();
        vec![(a, "a.txt".to_string()), (b, "b.txt".to_string())]
    }

    #[test]
    fn zip_round_trip_preserves_names_and_contents() {
        let base = tmp("mab-zip-rt");
        let entries = write_inputs(&base);
        let dest = base.join("out.zip");

        let mut seen = Vec::new();
        create_archive(
            ArchiveFormat::Zip,
            &entries,
            None,
            &dest,
            &mut |done, total| seen.push((done, total)),
        )
        .unwrap();
        assert_eq!(seen, vec![(1, 2), (2, 2)]);

        let out_dir = base.join("out");
        let report =
            extract_archive(&dest, "out.zip", &out_dir, None, ExtractLimits::default()).unwrap();

        let mut names: Vec<String> = report
            .extracted_files
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert_eq!(fs::read(out_dir.join("a.txt")).unwrap(), vec![b'a'; 100]);
        assert_eq!(fs::read(out_dir.join("b.txt")).unwrap(), vec![b'b'; 200]);
    }

    #[test]
    fn tar_gz_round_trip_preserves_contents() {
        let base = tmp("mab-tgz-rt");
        let entries = write_inputs(&base);
        let dest = base.join("out.tar.gz");

        create_archive(ArchiveFormat::TarGz, &entries, None, &dest, &mut |_, _| {}).unwrap();

        let out_dir = base.join("out");
        let report = extract_archive(&dest, "out.tar.gz", &out_dir, None, ExtractLimits::default())
            .unwrap();
        assert_eq!(report.extracted_files.len(), 2);
        assert_eq!(fs::read(out_dir.join("b.txt")).unwrap(), vec![b'b'; 200]);
    }

    #[test]
    fn password_zip_requires_the_right_password() {
        let base = tmp("mab-zip-pw");
        let entries = write_inputs(&base);
        let dest = base.join("secret.zip");

        create_archive(
            ArchiveFormat::Zip,
            &entries,
            Some("hunter2"),
            &dest,
            &mut |_, _| {},
        )
        .unwrap();

        // No password: unreadable.
        let no_pw = extract_archive(
            &dest,
            "secret.zip",
            &base.join("no-pw"),
            None,
            ExtractLimits::default(),
        );
        assert!(matches!(no_pw, Err(Error::Archive(_))));

        // Wrong password: unreadable.
        let wrong = extract_archive(
            &dest,
            "secret.zip",
            &base.join("wrong-pw"),
            Some("wrong"),
            ExtractLimits::default(),
        );
        assert!(matches!(wrong, Err(Error::Archive(_))));

        // Correct password: full round trip.
        let out_dir = base.join("ok");
        let report = extract_archive(
            &dest,
            "secret.zip",
            &out_dir,
            Some("hunter2"),
            ExtractLimits::default(),
        )
        .unwrap();
        assert_eq!(report.extracted_files.len(), 2);
        assert_eq!(fs::read(out_dir.join("a.txt")).unwrap(), vec![b'a'; 100]);
    }

    #[test]
    fn zip_blocks_path_traversal() {
        let base = tmp("mab-zip-trav");
        let zip_path = base.join("a.zip");
        let out_dir = base.join("out");
        fs::create_dir_all(&out_dir).unwrap();

        let f = fs::File::create(&zip_path).unwrap();
        let mut zw = ZipWriter::new(f);
        zw.start_file("../evil.txt", FileOptions::default())
            .unwrap();
        zw.write_all(b"x").unwrap();
        zw.finish().unwrap();

        let err = extract_archive(&zip_path, "a.zip", &out_dir, None, ExtractLimits::default())
            .unwrap_err();
        assert!(matches!(err, Error::Archive(_)));
    }

    #[test]
    fn tar_blocks_path_traversal() {
        let base = tmp("mab-tar-trav");
        let tar_path = base.join("a.tar");
        let out_dir = base.join("out");
        fs::create_dir_all(&out_dir).unwrap();

        fs::write(&tar_path, build_raw_tar_bytes("../evil.txt", b"x")).unwrap();

        let err = extract_archive(&tar_path, "a.tar", &out_dir, None, ExtractLimits::default())
            .unwrap_err();
        assert!(matches!(err, Error::Archive(_)));
    }

    #[test]
    fn enforces_per_file_size_limit() {
        let base = tmp("mab-sizelimit");
        let zip_path = base.join("a.zip");
        let out_dir = base.join("out");
        fs::create_dir_all(&out_dir).unwrap();

        let f = fs::File::create(&zip_path).unwrap();
        let mut zw = ZipWriter::new(f);
        zw.start_file("big.txt", FileOptions::default()).unwrap();
        zw.write_all(b"hello").unwrap(); // 5 bytes
        zw.finish().unwrap();

        let limits = ExtractLimits {
            max_files: 10,
            max_total_bytes: 100,
            max_file_bytes: 4,
        };
        let err = extract_archive(&zip_path, "a.zip", &out_dir, None, limits).unwrap_err();
        assert!(matches!(err, Error::Archive(_)));
    }

    #[test]
    fn enforces_total_size_limit() {
        let base = tmp("mab-totallimit");
        let zip_path = base.join("a.zip");
        let out_dir = base.join("out");
        fs::create_dir_all(&out_dir).unwrap();

        let f = fs::File::create(&zip_path).unwrap();
        let mut zw = ZipWriter::new(f);
        zw.start_file("a.txt", FileOptions::default()).unwrap();
        zw.write_all(b"hello").unwrap(); // 5
        zw.start_file("b.txt", FileOptions::default()).unwrap();
        zw.write_all(b"world").unwrap(); // 5
        zw.finish().unwrap();

        let limits = ExtractLimits {
            max_files: 10,
            max_total_bytes: 9, // < 10
            max_file_bytes: 10,
        };
        let err = extract_archive(&zip_path, "a.zip", &out_dir, None, limits).unwrap_err();
        assert!(matches!(err, Error::Archive(_)));
    }

    #[test]
    fn detects_format_from_display_name() {
        assert_eq!(detect_format("x.zip"), Some(ArchiveFormat::Zip));
        assert_eq!(detect_format("x.TAR"), Some(ArchiveFormat::Tar));
        assert_eq!(detect_format("x.tgz"), Some(ArchiveFormat::TarGz));
        assert_eq!(detect_format("x.tar.gz"), Some(ArchiveFormat::TarGz));
        assert_eq!(detect_format("x.rar"), None);
    }

    fn build_raw_tar_bytes(name: &str, data: &[u8]) -> Vec<u8> {
        // Minimal ustar header (512 bytes) + file data padded to 512 + end markers.
        let mut header = [0u8; 512];

        // name (0..100)
        let name_bytes = name.as_bytes();
        let n = name_bytes.len().min(100);
        header[0..n].copy_from_slice(&name_bytes[0..n]);

        // mode (100..108)
        write_octal(&mut header[100..108], 0o644);
        // uid/gid
        write_octal(&mut header[108..116], 0);
        write_octal(&mut header[116..124], 0);
        // size (124..136)
        write_octal12(&mut header[124..136], data.len() as u64);
        // mtime (136..148)
        write_octal12(&mut header[136..148], 0);

        // checksum field treated as spaces for calculation (148..156)
        for b in &mut header[148..156] {
            *b = b' ';
        }

        // typeflag (156)
        header[156] = b'0';

        // magic + version
        header[257..263].copy_from_slice(b"ustar\0");
        header[263..265].copy_from_slice(b"00");

        // compute checksum
        let sum: u32 = header.iter().map(|b| *b as u32).sum();
        write_checksum(&mut header[148..156], sum);

        let mut out = Vec::new();
        out.extend_from_slice(&header);
        out.extend_from_slice(data);
        // pad to 512 boundary
        let pad = (512 - (data.len() % 512)) % 512;
        out.extend(std::iter::repeat(0u8).take(pad));
        // end-of-archive: two 512-byte blocks of zeros
        out.extend(std::iter::repeat(0u8).take(1024));
        out
    }

    fn write_octal(dst: &mut [u8], val: u64) {
        let width = dst.len();
        let s = format!("{val:0width$o}\0", width = width - 1);
        dst.copy_from_slice(&s.as_bytes()[0..width]);
    }

    fn write_octal12(dst: &mut [u8], val: u64) {
        // 11 digits + NUL (tar size/mtime fields are 12 bytes).
        let s = format!("{val:011o}\0");
        dst.copy_from_slice(s.as_bytes());
    }

    fn write_checksum(dst: &mut [u8], sum: u32) {
        // 6 digits, NUL, space
        let s = format!("{sum:06o}\0 ");
        dst.copy_from_slice(s.as_bytes());
    }
}
