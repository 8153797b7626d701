//! Boundary to whatever turns an identity into decoded pixels. Archive
//! extraction and remote fetching live outside the engine and plug in here.

use dedupx_core::{Error, ImageIdentity, Result, SourceKind};
use image::{DynamicImage, ImageReader};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;

pub struct LoadedImage {
    pub pixels: DynamicImage,
    /// Size of the encoded source, when known.
    pub file_size: Option<u64>,
}

pub trait PixelSource: Send + Sync {
    fn load(&self, identity: &ImageIdentity) -> Result<LoadedImage>;
}

fn load_error(identity: &ImageIdentity, reason: impl ToString) -> Error {
    Error::ImageLoad {
        identity: identity.to_string(),
        reason: reason.to_string(),
    }
}

/// Decodes plain filesystem paths. Relative identities resolve against
/// `root` when one is set.
#[derive(Debug, Clone, Default)]
pub struct FsPixelSource {
    root: Option<PathBuf>,
}

impl FsPixelSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, identity: &ImageIdentity) -> PathBuf {
        let path = PathBuf::from(identity.as_str());
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path,
        }
    }
}

impl PixelSource for FsPixelSource {
    fn load(&self, identity: &ImageIdentity) -> Result<LoadedImage> {
        if identity.source_kind() != SourceKind::File {
            return Err(load_error(
                identity,
                format!("no loader for {} identities", identity.source_kind()),
            ));
        }
        let bytes = std::fs::read(self.resolve(identity)).map_err(|e| load_error(identity, e))?;
        let pixels = ImageReader::new(Cursor::new(&bytes))
            .with_guessed_format()
            .map_err(|e| load_error(identity, e))?
            .decode()
            .map_err(|e| load_error(identity, e))?;
        Ok(LoadedImage {
            pixels,
            file_size: Some(bytes.len() as u64),
        })
    }
}

/// Pixels already decoded by the caller, keyed by identity.
#[derive(Default)]
pub struct MemoryPixelSource {
    images: RwLock<HashMap<ImageIdentity, (DynamicImage, Option<u64>)>>,
}

impl MemoryPixelSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identity: ImageIdentity, pixels: DynamicImage, file_size: Option<u64>) {
        self.images.write().insert(identity, (pixels, file_size));
    }
}

impl PixelSource for MemoryPixelSource {
    fn load(&self, identity: &ImageIdentity) -> Result<LoadedImage> {
        let images = self.images.read();
        let (pixels, file_size) = images
            .get(identity)
            .ok_or_else(|| load_error(identity, "not registered"))?;
        Ok(LoadedImage {
            pixels: pixels.clone(),
            file_size: *file_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use tempfile::TempDir;

    #[test]
    fn test_fs_source_decodes_and_reports_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tile.png");
        RgbImage::from_pixel(12, 7, image::Rgb([10, 200, 30]))
            .save_with_format(&path, ImageFormat::Png)
            .unwrap();

        let source = FsPixelSource::with_root(dir.path());
        let loaded = source.load(&ImageIdentity::new("tile.png")).unwrap();
        assert_eq!((loaded.pixels.width(), loaded.pixels.height()), (12, 7));
        assert_eq!(loaded.file_size, Some(std::fs::metadata(&path).unwrap().len()));
    }

    #[test]
    fn test_fs_source_errors() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("junk.png"), b"not an image").unwrap();
        let source = FsPixelSource::with_root(dir.path());

        for id in ["missing.png", "junk.png", "archive://a.zip!/1.png", "https://x.org/1.png"] {
            assert!(matches!(
                source.load(&ImageIdentity::new(id)),
                Err(Error::ImageLoad { .. })
            ));
        }
    }

    #[test]
    fn test_memory_source() {
        let source = MemoryPixelSource::new();
        source.insert(ImageIdentity::new("a"), DynamicImage::new_rgb8(3, 3), Some(9));
        assert_eq!(source.load(&ImageIdentity::new("a")).unwrap().file_size, Some(9));
        assert!(source.load(&ImageIdentity::new("b")).is_err());
    }
}
