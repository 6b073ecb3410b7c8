use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::error::ImageDownloaderError;

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<(), ImageDownloaderError> {
    let file = fs::File::open(zip_path).map_err(|err| {
        ImageDownloaderError::Filesystem(format!("open zip {}: {err}", zip_path.display()))
    })?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(ImageDownloaderError::Filesystem(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
        }
        let mut outfile = fs::File::create(&entry_path)
            .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

/// The only file in `dir` with the given extension.
pub fn find_single_file(dir: &Path, extension: &str) -> Result<PathBuf, ImageDownloaderError> {
    let entries = fs::read_dir(dir).map_err(|err| {
        ImageDownloaderError::Filesystem(format!("read {}: {err}", dir.display()))
    })?;
    let mut matches = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?
            .path();
        let matched = path.is_file()
            && path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case(extension))
                .unwrap_or(false);
        if matched {
            matches.push(path);
        }
    }
    match matches.len() {
        1 => Ok(matches.remove(0)),
        0 => Err(ImageDownloaderError::Filesystem(format!(
            "no .{extension} file found in {}",
            dir.display()
        ))),
        count => Err(ImageDownloaderError::Filesystem(format!(
            "{count} .{extension} files found in {}, expected one",
            dir.display()
        ))),
    }
}
