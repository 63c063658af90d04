//! In-memory working copy of an EPUB container.

use std::fs::File;
use std::io::{BufReader, Read, Seek, Write};
use std::path::Path;

use quick_xml::Reader;
use quick_xml::events::Event;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::ArchiveError;

pub const MIMETYPE_PATH: &str = "mimetype";
pub const EPUB_MIMETYPE: &[u8] = b"application/epub+zip";
const CONTAINER_PATH: &str = "META-INF/container.xml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: String,
    pub data: Vec<u8>,
    pub compressed: bool,
    pub is_dir: bool,
}

impl Entry {
    pub fn file(path: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            data,
            compressed: true,
            is_dir: false,
        }
    }
}

/// Every entry of an archive, in physical order.
#[derive(Debug, Clone, Default)]
pub struct EpubArchive {
    pub entries: Vec<Entry>,
}

impl EpubArchive {
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: Read + Seek>(reader: R) -> Result<Self, ArchiveError> {
        let mut zip = ZipArchive::new(reader)?;
        let mut entries = Vec::with_capacity(zip.len());

        for i in 0..zip.len() {
            let mut file = zip.by_index(i)?;
            let mut data = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut data)?;
            entries.push(Entry {
                path: file.name().to_string(),
                data,
                compressed: file.compression() != CompressionMethod::Stored,
                is_dir: file.is_dir(),
            });
        }

        debug!(entries = entries.len(), "Archive loaded");
        Ok(Self { entries })
    }

    pub fn find(&self, path: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| !e.is_dir && e.path == path)
    }

    pub fn position(&self, path: &str) -> Option<usize> {
        self.entries.iter().position(|e| !e.is_dir && e.path == path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.find(path).is_some()
    }

    pub fn read_text(&self, path: &str) -> Result<String, ArchiveError> {
        let entry = self
            .find(path)
            .ok_or_else(|| ArchiveError::Invalid(format!("missing entry {}", path)))?;
        String::from_utf8(entry.data.clone())
            .map_err(|_| ArchiveError::Invalid(format!("{} is not UTF-8", path)))
    }

    /// Locate the package document: `container.xml`'s first rootfile, else
    /// the first `.opf` entry.
    pub fn package_path(&self) -> Result<String, ArchiveError> {
        if let Some(container) = self.find(CONTAINER_PATH) {
            let text = String::from_utf8_lossy(&container.data);
            match rootfile_path(&text) {
                Ok(Some(path)) if self.contains(&path) => return Ok(path),
                Ok(Some(path)) => warn!(path = %path, "container.xml points at a missing package"),
                Ok(None) => warn!("container.xml has no rootfile"),
                Err(e) => warn!(error = %e, "Unreadable container.xml"),
            }
        }

        self.entries
            .iter()
            .find(|e| !e.is_dir && e.path.to_ascii_lowercase().ends_with(".opf"))
            .map(|e| e.path.clone())
            .ok_or(ArchiveError::MissingPackage)
    }

    /// Serialize to `writer`. The `mimetype` entry always goes first,
    /// stored; it is synthesized when the source lacked one.
    pub fn write_to<W: Write + Seek>(&self, writer: W) -> Result<W, ArchiveError> {
        let mut zip = ZipWriter::new(writer);
        let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        let deflated =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        let mimetype = self
            .find(MIMETYPE_PATH)
            .map(|e| e.data.as_slice())
            .unwrap_or(EPUB_MIMETYPE);
        if !self.contains(MIMETYPE_PATH) {
            debug!("Synthesizing missing mimetype entry");
        }
        zip.start_file(MIMETYPE_PATH, stored)?;
        zip.write_all(mimetype)?;

        for entry in &self.entries {
            if entry.path == MIMETYPE_PATH {
                continue;
            }
            if entry.is_dir {
                zip.add_directory(entry.path.trim_end_matches('/'), stored)?;
                continue;
            }
            let options = if entry.compressed { deflated } else { stored };
            zip.start_file(entry.path.as_str(), options)?;
            zip.write_all(&entry.data)?;
        }

        Ok(zip.finish()?)
    }

    /// Write to a temporary file next to `dest`, then rename it into place.
    /// Nothing is left at `dest` unless the whole write succeeded.
    pub fn write_atomic(&self, dest: &Path) -> Result<u64, ArchiveError> {
        let dir = match dest.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let tmp = NamedTempFile::new_in(dir)?;
        let mut file = self.write_to(tmp.reopen()?)?;
        file.flush()?;
        file.sync_all()?;
        drop(file);

        let size = tmp.as_file().metadata()?.len();
        tmp.persist(dest).map_err(|e| ArchiveError::Io(e.error))?;
        Ok(size)
    }
}

fn rootfile_path(container: &str) -> Result<Option<String>, ArchiveError> {
    let mut reader = Reader::from_str(container);
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"rootfile" => {
                for attr in e.attributes() {
                    let attr = attr.map_err(quick_xml::Error::from)?;
                    if attr.key.local_name().as_ref() == b"full-path" {
                        let value = attr.unescape_value()?;
                        return Ok(Some(value.trim_start_matches('/').to_string()));
                    }
                }
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn build(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    const CONTAINER: &[u8] = br#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

    #[test]
    fn test_package_path_from_container() {
        let bytes = build(&[
            ("META-INF/container.xml", CONTAINER),
            ("OEBPS/content.opf", b"<package/>"),
            ("other.opf", b"<package/>"),
        ]);
        let archive = EpubArchive::from_reader(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.package_path().unwrap(), "OEBPS/content.opf");
    }

    #[test]
    fn test_package_path_falls_back_to_first_opf() {
        let bytes = build(&[("book/package.OPF", b"<package/>")]);
        let archive = EpubArchive::from_reader(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.package_path().unwrap(), "book/package.OPF");
    }

    #[test]
    fn test_missing_package() {
        let bytes = build(&[("readme.txt", b"hi")]);
        let archive = EpubArchive::from_reader(Cursor::new(bytes)).unwrap();
        assert!(matches!(archive.package_path(), Err(ArchiveError::MissingPackage)));
    }

    #[test]
    fn test_write_puts_stored_mimetype_first() {
        // mimetype deliberately not first in the source
        let bytes = build(&[
            ("OEBPS/content.opf", b"<package/>"),
            ("mimetype", EPUB_MIMETYPE),
        ]);
        let archive = EpubArchive::from_reader(Cursor::new(bytes)).unwrap();
        let out = archive.write_to(Cursor::new(Vec::new())).unwrap().into_inner();

        let mut zip = ZipArchive::new(Cursor::new(out)).unwrap();
        assert_eq!(zip.len(), 2);
        let first = zip.by_index(0).unwrap();
        assert_eq!(first.name(), "mimetype");
        assert_eq!(first.compression(), CompressionMethod::Stored);
    }

    #[test]
    fn test_write_synthesizes_missing_mimetype() {
        let archive = EpubArchive {
            entries: vec![Entry::file("OEBPS/content.opf", b"<package/>".to_vec())],
        };
        let out = archive.write_to(Cursor::new(Vec::new())).unwrap().into_inner();

        let mut zip = ZipArchive::new(Cursor::new(out)).unwrap();
        let mut first = zip.by_index(0).unwrap();
        let mut text = String::new();
        first.read_to_string(&mut text).unwrap();
        assert_eq!(first.name(), "mimetype");
        assert_eq!(text.as_bytes(), EPUB_MIMETYPE);
    }

    #[test]
    fn test_write_atomic_replaces_destination() {
        let temp = tempdir().unwrap();
        let dest = temp.path().join("out.epub");
        std::fs::write(&dest, b"stale").unwrap();

        let archive = EpubArchive {
            entries: vec![Entry::file("a.txt", b"hello".to_vec())],
        };
        let size = archive.write_atomic(&dest).unwrap();

        assert_eq!(std::fs::metadata(&dest).unwrap().len(), size);
        let reopened = EpubArchive::open(&dest).unwrap();
        assert_eq!(reopened.find("a.txt").unwrap().data, b"hello");
        // Only the destination remains in the directory
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1);
    }
}
