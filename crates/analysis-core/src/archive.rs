//! Archive Adapter (§4.2): unwraps AAR-style archives into the classes jar
//! they bundle. Klib-style binaries are handed off to `klib.rs` instead.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::warn;

const INNER_CLASSES_JAR: &str = "classes.jar";

/// Extract the inner `classes.jar` from an `.aar` to a uniquely-named temp
/// directory, returning the path to the extracted jar. Never fatal: a
/// missing entry or a corrupt zip logs a warning and returns `None`, and the
/// caller drops the classpath entry (§4.2, §7's "archive adaptation
/// failure").
pub fn unwrap_aar(aar_path: &Path) -> Option<PathBuf> {
    let file = match fs::File::open(aar_path) {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %aar_path.display(), error = %e, "failed to open aar");
            return None;
        }
    };

    let mut archive = match zip::ZipArchive::new(file) {
        Ok(a) => a,
        Err(e) => {
            warn!(path = %aar_path.display(), error = %e, "failed to read aar as zip");
            return None;
        }
    };

    let mut entry = match archive.by_name(INNER_CLASSES_JAR) {
        Ok(entry) => entry,
        Err(_) => {
            warn!(path = %aar_path.display(), "aar has no classes.jar entry");
            return None;
        }
    };

    let mut bytes = Vec::with_capacity(entry.size() as usize);
    if let Err(e) = entry.read_to_end(&mut bytes) {
        warn!(path = %aar_path.display(), error = %e, "failed to extract classes.jar");
        return None;
    }
    drop(entry);

    let dest_dir = match tempfile::Builder::new().prefix("aar-extract-").tempdir() {
        Ok(dir) => dir.into_path(),
        Err(e) => {
            warn!(error = %e, "failed to allocate temp dir for aar extraction");
            return None;
        }
    };
    let dest_jar = dest_dir.join(INNER_CLASSES_JAR);
    if let Err(e) = fs::write(&dest_jar, &bytes) {
        warn!(path = %dest_jar.display(), error = %e, "failed to write extracted classes.jar");
        return None;
    }

    Some(dest_jar)
}

/// Resolves a classpath entry that may be an archive needing unwrapping.
/// Plain jars and directories pass through unchanged. `.klib` entries are
/// left untouched here; they're handled separately by the session builder,
/// which routes them through `klib.rs`.
pub fn adapt_classpath_entry(path: &Path) -> Option<PathBuf> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("aar") => unwrap_aar(path),
        _ => Some(path.to_path_buf()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fake_aar(path: &Path, with_classes_jar: bool) {
        let file = fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        if with_classes_jar {
            zip.start_file(INNER_CLASSES_JAR, zip::write::FileOptions::default())
                .unwrap();
            zip.write_all(b"PK-fake-jar-bytes").unwrap();
        } else {
            zip.start_file("AndroidManifest.xml", zip::write::FileOptions::default())
                .unwrap();
            zip.write_all(b"<manifest/>").unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn unwraps_classes_jar_from_valid_aar() {
        let dir = tempfile::tempdir().unwrap();
        let aar_path = dir.path().join("library.aar");
        write_fake_aar(&aar_path, true);

        let extracted = unwrap_aar(&aar_path).expect("should extract classes.jar");
        assert_eq!(extracted.file_name().unwrap(), INNER_CLASSES_JAR);
        assert!(extracted.exists());
        assert_eq!(fs::read(&extracted).unwrap(), b"PK-fake-jar-bytes");
    }

    #[test]
    fn missing_inner_entry_returns_none_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let aar_path = dir.path().join("no-classes.aar");
        write_fake_aar(&aar_path, false);

        assert!(unwrap_aar(&aar_path).is_none());
    }

    #[test]
    fn corrupt_zip_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let aar_path = dir.path().join("corrupt.aar");
        fs::write(&aar_path, b"not a zip file").unwrap();

        assert!(unwrap_aar(&aar_path).is_none());
    }

    #[test]
    fn non_archive_classpath_entries_pass_through() {
        let path = PathBuf::from("/libs/kotlin-stdlib.jar");
        assert_eq!(adapt_classpath_entry(&path), Some(path));
    }
}
