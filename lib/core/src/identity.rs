use serde::{Deserialize, Serialize};
use std::fmt;

const ARCHIVE_SCHEME: &str = "archive://";
const ARCHIVE_SEPARATOR: &str = "!/";

/// Opaque, stable key for an image: a filesystem path, an archive entry
/// (`archive://books/vol1.zip!/003.jpg`), or a remote URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageIdentity(String);

/// Where the bytes behind an identity live, derived from its shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    Archive,
    Url,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::File => "file",
            SourceKind::Archive => "archive",
            SourceKind::Url => "url",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ImageIdentity {
    #[inline]
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn source_kind(&self) -> SourceKind {
        if self.0.starts_with(ARCHIVE_SCHEME) || self.0.contains(ARCHIVE_SEPARATOR) {
            SourceKind::Archive
        } else if self.0.contains("://") {
            SourceKind::Url
        } else {
            SourceKind::File
        }
    }

    /// Splits an archive identity into `(container, entry)`.
    pub fn archive_parts(&self) -> Option<(&str, &str)> {
        let body = self.0.strip_prefix(ARCHIVE_SCHEME).unwrap_or(&self.0);
        body.split_once(ARCHIVE_SEPARATOR)
    }

    /// File name of the container, for archive-embedded images.
    pub fn archive_name(&self) -> Option<&str> {
        let (container, _) = self.archive_parts()?;
        Some(last_segment(container))
    }

    /// Last path segment of the image itself (the entry name for archive members).
    pub fn file_name(&self) -> &str {
        let path = match self.archive_parts() {
            Some((_, entry)) => entry,
            None => self.path_part(),
        };
        last_segment(path)
    }

    /// Lower-cased extension without the dot.
    pub fn extension(&self) -> Option<String> {
        let name = self.file_name();
        match name.rfind('.') {
            Some(pos) if pos > 0 && pos + 1 < name.len() => Some(name[pos + 1..].to_ascii_lowercase()),
            _ => None,
        }
    }

    /// The identity with the image extension stripped. Two encodings of the
    /// same picture (`a/01.png`, `a/01.webp`) share a base.
    pub fn base(&self) -> &str {
        let name = self.file_name();
        match name.rfind('.') {
            Some(pos) if pos > 0 => {
                let cut = name.len() - pos;
                let end = self.end_of_path();
                &self.0[..end - cut]
            }
            _ => &self.0[..self.end_of_path()],
        }
    }

    fn path_part(&self) -> &str {
        &self.0[..self.end_of_path()]
    }

    // Query strings and fragments on URLs are not part of the file name.
    fn end_of_path(&self) -> usize {
        if self.source_kind() == SourceKind::Url {
            self.0.find(['?', '#']).unwrap_or(self.0.len())
        } else {
            self.0.len()
        }
    }
}

fn last_segment(path: &str) -> &str {
    let trimmed = path.trim_end_matches(['/', '\\']);
    trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed)
}

impl fmt::Display for ImageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ImageIdentity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ImageIdentity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for ImageIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind() {
        assert_eq!(ImageIdentity::new("/photos/a.jpg").source_kind(), SourceKind::File);
        assert_eq!(
            ImageIdentity::new("archive:///books/v1.zip!/001.png").source_kind(),
            SourceKind::Archive
        );
        assert_eq!(ImageIdentity::new("D:/books/v1.cbz!/p/001.png").source_kind(), SourceKind::Archive);
        assert_eq!(
            ImageIdentity::new("https://example.com/img/cat.webp").source_kind(),
            SourceKind::Url
        );
    }

    #[test]
    fn test_archive_components() {
        let id = ImageIdentity::new("archive:///books/v1.zip!/chapter/001.PNG");
        assert_eq!(id.archive_name(), Some("v1.zip"));
        assert_eq!(id.file_name(), "001.PNG");
        assert_eq!(id.extension().as_deref(), Some("png"));
        assert_eq!(id.base(), "archive:///books/v1.zip!/chapter/001");
    }

    #[test]
    fn test_base_and_extension() {
        let id = ImageIdentity::new("/photos/2024/img.final.jpeg");
        assert_eq!(id.base(), "/photos/2024/img.final");
        assert_eq!(id.extension().as_deref(), Some("jpeg"));

        let bare = ImageIdentity::new("/photos/README");
        assert_eq!(bare.base(), "/photos/README");
        assert_eq!(bare.extension(), None);

        let dotfile = ImageIdentity::new("/photos/.hidden");
        assert_eq!(dotfile.extension(), None);
    }

    #[test]
    fn test_url_query_is_not_extension() {
        let id = ImageIdentity::new("https://cdn.example.com/a/b.png?w=300");
        assert_eq!(id.file_name(), "b.png");
        assert_eq!(id.extension().as_deref(), Some("png"));
        assert_eq!(id.base(), "https://cdn.example.com/a/b");
    }
}
