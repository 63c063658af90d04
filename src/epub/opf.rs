//! Package document (OPF) model and in-place edits.
//!
//! The document is parsed once with quick-xml to locate manifest items,
//! spine references and the cover meta tag, recording the byte span of each
//! tag. Edits are then applied to the original text by span, so everything
//! not touched (comments, namespaces, formatting) survives verbatim.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::LazyLock;

use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use regex::Regex;

use crate::epub::href;
use crate::error::ArchiveError;

static HREF_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(\s)href\s*=\s*(?:"[^"]*"|'[^']*')"#).expect("valid href pattern")
});

static MEDIA_TYPE_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(\s)media-type\s*=\s*(?:"[^"]*"|'[^']*')"#).expect("valid media-type pattern")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestItem {
    pub id: String,
    pub href: String,
    pub media_type: String,
    pub properties: Option<String>,
    span: Range<usize>,
}

impl ManifestItem {
    pub fn is_image(&self) -> bool {
        self.media_type.to_ascii_lowercase().starts_with("image/")
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties
            .as_deref()
            .is_some_and(|p| p.split_whitespace().any(|p| p == name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpineRef {
    pub idref: String,
    span: Range<usize>,
}

#[derive(Debug, Clone)]
struct CoverMeta {
    content: String,
    span: Range<usize>,
}

#[derive(Debug, Clone)]
pub struct PackageDocument {
    path: String,
    text: String,
    pub manifest: Vec<ManifestItem>,
    pub spine: Vec<SpineRef>,
    cover_meta: Option<CoverMeta>,
    /// Offset of the first `</metadata>`.
    metadata_close: Option<usize>,
}

impl PackageDocument {
    pub fn parse(path: &str, text: String) -> Result<Self, ArchiveError> {
        let mut manifest = Vec::new();
        let mut spine = Vec::new();
        let mut cover_meta = None;
        let mut metadata_close = None;
        let mut saw_package = false;

        {
            let mut reader = Reader::from_str(&text);
            loop {
                let event = reader.read_event()?;
                let end = reader.buffer_position();
                let start = text[..end].rfind('<').unwrap_or(0);

                match event {
                    Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                        b"package" => saw_package = true,
                        b"item" => {
                            let id = attribute(&e, b"id")?.unwrap_or_default();
                            let item_href = attribute(&e, b"href")?.unwrap_or_default();
                            if id.is_empty() || item_href.is_empty() {
                                continue;
                            }
                            manifest.push(ManifestItem {
                                id,
                                href: item_href,
                                media_type: attribute(&e, b"media-type")?.unwrap_or_default(),
                                properties: attribute(&e, b"properties")?,
                                span: start..end,
                            });
                        }
                        b"itemref" => {
                            if let Some(idref) = attribute(&e, b"idref")? {
                                spine.push(SpineRef {
                                    idref,
                                    span: start..end,
                                });
                            }
                        }
                        b"meta" if cover_meta.is_none() => {
                            if attribute(&e, b"name")?.as_deref() == Some("cover") {
                                cover_meta = Some(CoverMeta {
                                    content: attribute(&e, b"content")?.unwrap_or_default(),
                                    span: start..end,
                                });
                            }
                        }
                        _ => {}
                    },
                    Event::End(e) if e.local_name().as_ref() == b"metadata" => {
                        if metadata_close.is_none() {
                            metadata_close = Some(start);
                        }
                    }
                    Event::Eof => break,
                    _ => {}
                }
            }
        }

        if !saw_package {
            return Err(ArchiveError::Invalid(format!(
                "{} is not a package document",
                path
            )));
        }

        Ok(Self {
            path: path.to_string(),
            text,
            manifest,
            spine,
            cover_meta,
            metadata_close,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Directory hrefs in this document are relative to.
    pub fn base_dir(&self) -> &str {
        href::parent_dir(&self.path)
    }

    pub fn item(&self, id: &str) -> Option<&ManifestItem> {
        self.manifest.iter().find(|i| i.id == id)
    }

    /// Archive path an item points at.
    pub fn item_path(&self, item: &ManifestItem) -> Option<String> {
        href::resolve(self.base_dir(), &item.href)
    }

    pub fn item_by_path(&self, path: &str) -> Option<&ManifestItem> {
        self.manifest
            .iter()
            .find(|i| self.item_path(i).as_deref() == Some(path))
    }

    /// The designated cover image, if any.
    ///
    /// Checked in order: the `cover-image` property, the `<meta name="cover">`
    /// reference, then an image item whose file is named `cover.*`, then an
    /// image item whose id mentions "cover".
    pub fn cover_item(&self) -> Option<&ManifestItem> {
        if let Some(item) = self.manifest.iter().find(|i| i.has_property("cover-image")) {
            return Some(item);
        }

        if let Some(meta) = &self.cover_meta {
            let by_id = self.item(&meta.content);
            let by_path = href::resolve(self.base_dir(), &meta.content)
                .and_then(|p| self.item_by_path(&p));
            if let Some(item) = by_id.or(by_path).filter(|i| i.is_image()) {
                return Some(item);
            }
        }

        self.manifest
            .iter()
            .filter(|i| i.is_image())
            .find(|i| {
                let name = href::file_name(href::split_suffix(&i.href).0);
                name.to_ascii_lowercase()
                    .rsplit_once('.')
                    .is_some_and(|(stem, _)| stem == "cover")
            })
            .or_else(|| {
                self.manifest
                    .iter()
                    .filter(|i| i.is_image())
                    .find(|i| i.id.to_ascii_lowercase().contains("cover"))
            })
    }

    pub fn edit(&self) -> OpfEditor<'_> {
        OpfEditor {
            doc: self,
            edits: Vec::new(),
            taken_ids: self.manifest.iter().map(|i| i.id.clone()).collect(),
        }
    }
}

fn attribute(e: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>, ArchiveError> {
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        if attr.key.local_name().as_ref() == name {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

#[derive(Debug)]
struct Edit {
    span: Range<usize>,
    text: String,
    seq: usize,
}

/// A new manifest item to add.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    pub id: String,
    pub href: String,
    pub media_type: String,
}

/// Accumulates span edits against a [`PackageDocument`].
pub struct OpfEditor<'a> {
    doc: &'a PackageDocument,
    edits: Vec<Edit>,
    taken_ids: HashSet<String>,
}

impl OpfEditor<'_> {
    fn push(&mut self, span: Range<usize>, text: String) {
        let seq = self.edits.len();
        self.edits.push(Edit { span, text, seq });
    }

    /// Point an item at a new href and media type, keeping its other
    /// attributes as written.
    pub fn retarget_item(&mut self, id: &str, new_href: &str, media_type: &str) -> bool {
        let Some(item) = self.doc.item(id) else {
            return false;
        };
        let tag = &self.doc.text[item.span.clone()];
        let href_value = format!(r#"${{1}}href="{}""#, escape(new_href).replace('$', "$$"));
        let media_value = format!(r#"${{1}}media-type="{}""#, escape(media_type));
        let tag = HREF_ATTR.replace(tag, href_value.as_str());
        let tag = MEDIA_TYPE_ATTR.replace(&tag, media_value.as_str()).into_owned();
        self.push(item.span.clone(), tag);
        true
    }

    /// Reserve a manifest id derived from `base`.
    pub fn unique_id(&mut self, base: &str) -> String {
        let mut candidate = base.to_string();
        let mut n = 1;
        while self.taken_ids.contains(&candidate) {
            n += 1;
            candidate = format!("{}-{}", base, n);
        }
        self.taken_ids.insert(candidate.clone());
        candidate
    }

    /// Insert items right after the manifest item `after_id`, in order.
    pub fn insert_items_after(&mut self, after_id: &str, items: &[NewItem]) -> bool {
        let Some(anchor) = self.doc.item(after_id) else {
            return false;
        };
        let at = anchor.span.end;
        let indent = line_indent(&self.doc.text, anchor.span.start);
        let mut text = String::new();
        for item in items {
            text.push_str(&format!(
                "\n{}<item id=\"{}\" href=\"{}\" media-type=\"{}\"/>",
                indent,
                escape(&item.id),
                escape(&item.href),
                escape(&item.media_type)
            ));
        }
        self.push(at..at, text);
        true
    }

    /// After every spine reference to `after_id`, add references to `ids`.
    pub fn insert_spine_refs_after(&mut self, after_id: &str, ids: &[String]) -> usize {
        let anchors: Vec<Range<usize>> = self
            .doc
            .spine
            .iter()
            .filter(|r| r.idref == after_id)
            .map(|r| r.span.clone())
            .collect();

        for span in &anchors {
            let indent = line_indent(&self.doc.text, span.start);
            let mut text = String::new();
            for id in ids {
                text.push_str(&format!("\n{}<itemref idref=\"{}\"/>", indent, escape(id)));
            }
            self.push(span.end..span.end, text);
        }
        anchors.len()
    }

    /// Make `<meta name="cover">` name `cover_id`. An existing tag with a
    /// different value is replaced; a missing one is added before the first
    /// `</metadata>` only. Returns whether anything changed.
    pub fn set_cover_meta(&mut self, cover_id: &str) -> bool {
        let tag = format!(r#"<meta name="cover" content="{}"/>"#, escape(cover_id));
        match &self.doc.cover_meta {
            Some(meta) if meta.content == cover_id => false,
            Some(meta) => {
                self.push(meta.span.clone(), tag);
                true
            }
            None => match self.doc.metadata_close {
                Some(at) => {
                    self.push(at..at, format!("  {}\n  ", tag));
                    true
                }
                None => false,
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Apply all edits, back to front, and return the new document text.
    pub fn finish(mut self) -> String {
        self.edits
            .sort_by(|a, b| (b.span.start, b.seq).cmp(&(a.span.start, a.seq)));

        let mut text = self.doc.text.clone();
        for edit in self.edits {
            text.replace_range(edit.span, &edit.text);
        }
        text
    }
}

/// Leading whitespace of the line containing `offset`.
fn line_indent(text: &str, offset: usize) -> &str {
    let line_start = text[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let line = &text[line_start..offset];
    let trimmed = line.trim_start();
    &line[..line.len() - trimmed.len()]
}
