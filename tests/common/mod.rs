//! EPUB and image fixtures built in code.
#![allow(dead_code)]

use std::io::{Cursor, Read, Write};
use std::path::Path;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const CONTAINER_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

pub struct EpubBuilder {
    files: Vec<(String, Vec<u8>)>,
    mimetype: bool,
}

impl EpubBuilder {
    /// A builder with the container document already in place.
    pub fn new() -> Self {
        Self {
            files: vec![(
                "META-INF/container.xml".to_string(),
                CONTAINER_XML.as_bytes().to_vec(),
            )],
            mimetype: true,
        }
    }

    pub fn file(mut self, path: &str, data: impl Into<Vec<u8>>) -> Self {
        self.files.push((path.to_string(), data.into()));
        self
    }

    pub fn without_mimetype(mut self) -> Self {
        self.mimetype = false;
        self
    }

    pub fn write(&self, path: &Path) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = ZipWriter::new(file);
        let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        if self.mimetype {
            zip.start_file(
                "mimetype",
                SimpleFileOptions::default().compression_method(CompressionMethod::Stored),
            )
            .unwrap();
            zip.write_all(b"application/epub+zip").unwrap();
        }
        for (name, data) in &self.files {
            zip.start_file(name.as_str(), deflated).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }
}

/// Package document listing `manifest` items as `(id, href, media-type)`
/// and the spine as item ids.
pub fn opf(manifest: &[(&str, &str, &str)], spine: &[&str], extra_meta: &str) -> String {
    let items: String = manifest
        .iter()
        .map(|(id, href, media)| {
            format!(r#"    <item id="{}" href="{}" media-type="{}"/>"#, id, href, media) + "\n"
        })
        .collect();
    let refs: String = spine
        .iter()
        .map(|id| format!(r#"    <itemref idref="{}"/>"#, id) + "\n")
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="uid">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:identifier id="uid">urn:uuid:fixture</dc:identifier>
    <dc:title>Fixture</dc:title>
    {}
  </metadata>
  <manifest>
{}  </manifest>
  <spine>
{}  </spine>
</package>"#,
        extra_meta, items, refs
    )
}

pub fn xhtml(title: &str, body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head><title>{}</title></head>
<body>
{}
</body>
</html>"#,
        title, body
    )
}

pub fn png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, Rgba([200, 40, 40, 255]));
    encode(DynamicImage::ImageRgba8(img), ImageFormat::Png)
}

pub fn gif(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, Rgba([10, 120, 10, 255]));
    encode(DynamicImage::ImageRgba8(img), ImageFormat::Gif)
}

pub fn jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([30, 30, 200]));
    encode(DynamicImage::ImageRgb8(img), ImageFormat::Jpeg)
}

fn encode(img: DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), format).unwrap();
    buf
}

/// Entry names of an archive, in stored order.
pub fn entry_names(path: &Path) -> Vec<String> {
    let mut archive = ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
    (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect()
}

pub fn read_entry(path: &Path, name: &str) -> Option<Vec<u8>> {
    let mut archive = ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
    let mut file = archive.by_name(name).ok()?;
    let mut data = Vec::new();
    file.read_to_end(&mut data).unwrap();
    Some(data)
}

pub fn read_text(path: &Path, name: &str) -> String {
    String::from_utf8(read_entry(path, name).unwrap()).unwrap()
}

/// Whether `data` is a baseline (SOF0) JPEG.
pub fn is_baseline_jpeg(data: &[u8]) -> bool {
    if data.len() < 4 || data[0] != 0xFF || data[1] != 0xD8 {
        return false;
    }
    let mut i = 2;
    while i + 4 <= data.len() {
        if data[i] != 0xFF {
            return false;
        }
        let marker = data[i + 1];
        match marker {
            0xC0 => return true,
            0xC1..=0xCF if marker != 0xC4 && marker != 0xC8 && marker != 0xCC => return false,
            0xD8 | 0x01 | 0xD0..=0xD7 => i += 2,
            _ => {
                let len = u16::from_be_bytes([data[i + 2], data[i + 3]]) as usize;
                i += 2 + len;
            }
        }
    }
    false
}
