//! File intake: turns a user-selected path into a validated image handle.

use crate::error::IntakeError;
use bytes::Bytes;
use std::path::Path;

/// Largest accepted upload.
pub const MAX_IMAGE_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageMime {
    Png,
    Jpeg,
    Gif,
}

impl ImageMime {
    pub fn from_filename(name: &str) -> Option<Self> {
        let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "png" => Some(ImageMime::Png),
            "jpg" | "jpeg" => Some(ImageMime::Jpeg),
            "gif" => Some(ImageMime::Gif),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ImageMime::Png => "image/png",
            ImageMime::Jpeg => "image/jpeg",
            ImageMime::Gif => "image/gif",
        }
    }
}

/// A validated image ready to upload. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct ImageFile {
    pub name: String,
    pub mime: ImageMime,
    pub bytes: Bytes,
}

impl ImageFile {
    /// Read and validate an image from disk. Size and type are checked before the read.
    pub fn load(path: &Path) -> Result<Self, IntakeError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("image")
            .to_string();
        let mime =
            ImageMime::from_filename(&name).ok_or_else(|| IntakeError::UnsupportedType {
                name: name.clone(),
            })?;
        let io_err = |source| IntakeError::Io {
            path: path.display().to_string(),
            source,
        };
        let size = std::fs::metadata(path).map_err(io_err)?.len();
        check_size(&name, size)?;
        let data = std::fs::read(path).map_err(io_err)?;
        // The file may have changed between stat and read.
        check_size(&name, data.len() as u64)?;
        Ok(Self {
            name,
            mime,
            bytes: Bytes::from(data),
        })
    }

    /// Validate an in-memory image, e.g. one handed over by a picker.
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Bytes>) -> Result<Self, IntakeError> {
        let name = name.into();
        let bytes = bytes.into();
        let mime =
            ImageMime::from_filename(&name).ok_or_else(|| IntakeError::UnsupportedType {
                name: name.clone(),
            })?;
        check_size(&name, bytes.len() as u64)?;
        Ok(Self { name, mime, bytes })
    }

    /// Short description for preview lines, e.g. `cat.png (image/png, 12.3 KiB)`.
    pub fn describe(&self) -> String {
        format!(
            "{} ({}, {:.1} KiB)",
            self.name,
            self.mime.as_str(),
            self.bytes.len() as f64 / 1024.0
        )
    }
}

fn check_size(name: &str, size: u64) -> Result<(), IntakeError> {
    if size == 0 {
        return Err(IntakeError::Empty {
            name: name.to_string(),
        });
    }
    if size > MAX_IMAGE_BYTES {
        return Err(IntakeError::TooLarge {
            name: name.to_string(),
            size,
            limit: MAX_IMAGE_BYTES,
        });
    }
    Ok(())
}
