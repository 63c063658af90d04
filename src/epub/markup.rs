//! Reference rewriting in content documents, stylesheets and NCX files.
//!
//! Content documents are edited textually with targeted patterns rather than
//! re-serialized, so markup the reader does not care about is preserved
//! byte for byte.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::epub::href;

/// Where a converted image now lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRename {
    pub new_path: String,
    /// Further pages of a split image, in reading order.
    pub extra_pages: Vec<String>,
}

/// Renames keyed by the image's original full archive path.
pub type RenameMap = HashMap<String, ImageRename>;

static LINK_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(\s(?:xlink:)?(?:src|href)\s*=\s*)(?:"([^"]*)"|'([^']*)')"#)
        .expect("valid link attribute pattern")
});

static CSS_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)url\(\s*(?:"([^"]*)"|'([^']*)'|([^)"'\s]+))\s*\)"#)
        .expect("valid css url pattern")
});

static IMG_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<img\b[^>]*>").expect("valid img pattern"));

static SRC_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(\ssrc\s*=\s*)(?:"([^"]*)"|'([^']*)')"#).expect("valid src pattern")
});

static SVG_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<svg\b.*?</svg\s*>").expect("valid svg pattern"));

static SVG_IMAGE_HREF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<image\b[^>]*?\s(?:xlink:)?href\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
        .expect("valid svg image pattern")
});

static EMBED_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)<object\b[^>]*?\sdata\s*=\s*(?:"([^"]*)"|'([^']*)')[^>]*?(?:/>|>.*?</object\s*>)|<(?:embed|img)\b[^>]*?\ssrc\s*=\s*(?:"([^"]*)"|'([^']*)')[^>]*>"#,
    )
    .expect("valid embed pattern")
});

const COVER_MARKERS: [&str; 4] = [
    "calibre:cover",
    "name=\"cover\"",
    "<title>Cover</title>",
    "epub:type=\"cover\"",
];

/// Whether a file with this extension can carry image references.
pub fn is_reference_document(path: &str) -> bool {
    matches!(
        href::extension(path).as_deref(),
        Some("xhtml" | "html" | "htm" | "css" | "ncx" | "svg")
    )
}

/// XHTML/HTML pages, the only documents whose markup may be restructured.
pub fn is_content_document(path: &str) -> bool {
    matches!(
        href::extension(path).as_deref(),
        Some("xhtml" | "html" | "htm")
    )
}

/// Value of a `"..."` / `'...'` alternation captured as groups
/// `double` and `double + 1`, with the quote it used.
fn quoted<'h>(caps: &Captures<'h>, double: usize) -> Option<(&'h str, &'static str)> {
    if let Some(m) = caps.get(double) {
        return Some((m.as_str(), "\""));
    }
    caps.get(double + 1).map(|m| (m.as_str(), "'"))
}

fn lookup<'r>(renames: &'r RenameMap, base: &str, value: &str) -> Option<&'r ImageRename> {
    href::resolve(base, value).and_then(|p| renames.get(&p))
}

/// Rewrite every reference in `text` (a document at `doc_path`) that
/// resolves to a renamed image. `<img>` tags pointing at a split image are
/// repeated once per page. Returns `None` when nothing changed.
pub fn rewrite_references(text: &str, doc_path: &str, renames: &RenameMap) -> Option<String> {
    if renames.is_empty() {
        return None;
    }
    let base = href::parent_dir(doc_path);

    let expanded = if is_content_document(doc_path) {
        IMG_TAG.replace_all(text, |caps: &Captures| {
            let tag = &caps[0];
            let Some(src) = SRC_ATTR.captures(tag) else {
                return tag.to_string();
            };
            let Some((value, _)) = quoted(&src, 2) else {
                return tag.to_string();
            };
            match lookup(renames, base, value) {
                Some(rename) if !rename.extra_pages.is_empty() => {
                    let mut out = tag.to_string();
                    for page in &rename.extra_pages {
                        let page_href = href::with_file_name(value, href::file_name(page));
                        let copy = SRC_ATTR.replace(tag, |c: &Captures| {
                            format!("{}\"{}\"", &c[1], page_href)
                        });
                        out.push('\n');
                        out.push_str(&copy);
                    }
                    out
                }
                _ => tag.to_string(),
            }
        })
    } else {
        text.into()
    };

    let attrs = LINK_ATTR.replace_all(&expanded, |caps: &Captures| {
        let Some((value, quote)) = quoted(caps, 2) else {
            return caps[0].to_string();
        };
        match lookup(renames, base, value) {
            Some(rename) => format!(
                "{}{q}{}{q}",
                &caps[1],
                href::with_file_name(value, href::file_name(&rename.new_path)),
                q = quote
            ),
            None => caps[0].to_string(),
        }
    });

    let urls = CSS_URL.replace_all(&attrs, |caps: &Captures| {
        let (value, quote) = match quoted(caps, 1) {
            Some(found) => found,
            None => match caps.get(3) {
                Some(m) => (m.as_str(), ""),
                None => return caps[0].to_string(),
            },
        };
        match lookup(renames, base, value) {
            Some(rename) => format!(
                "url({q}{}{q})",
                href::with_file_name(value, href::file_name(&rename.new_path)),
                q = quote
            ),
            None => caps[0].to_string(),
        }
    });

    if urls == text {
        None
    } else {
        Some(urls.into_owned())
    }
}

/// Replace an inline `<svg>` cover wrapper with a plain `<img>`.
///
/// Applies to the first `<svg>` block whose embedded `<image>` resolves to
/// `cover_path`, or, on a page marked as a cover, to the first `<svg>` block
/// embedding any image. The rest of the page is left untouched. Standalone
/// `.svg` resources are never rewritten.
pub fn fix_inline_svg_cover(text: &str, doc_path: &str, cover_path: Option<&str>) -> Option<String> {
    if !is_content_document(doc_path) || !text.contains("<svg") {
        return None;
    }
    let base = href::parent_dir(doc_path);
    let marked = COVER_MARKERS.iter().any(|m| text.contains(m));

    for block in SVG_BLOCK.find_iter(text) {
        let Some(caps) = SVG_IMAGE_HREF.captures(block.as_str()) else {
            continue;
        };
        let Some((image_href, _)) = quoted(&caps, 1) else {
            continue;
        };
        let resolved = href::resolve(base, image_href);
        let is_cover = match (cover_path, resolved.as_deref()) {
            (Some(cover), Some(found)) => cover == found,
            _ => false,
        };
        if !is_cover && !marked {
            continue;
        }

        let mut out = String::with_capacity(text.len());
        out.push_str(&text[..block.start()]);
        out.push_str(&format!(r#"<img alt="Cover" src="{}"/>"#, image_href));
        out.push_str(&text[block.end()..]);
        return Some(out);
    }
    None
}

/// Replace `<img>`, `<object>` and `<embed>` references to the SVG file at
/// `svg_path` with an `<img>` of the rasterized cover at `raster_path`.
pub fn replace_svg_embeds(
    text: &str,
    doc_path: &str,
    svg_path: &str,
    raster_path: &str,
) -> Option<String> {
    let base = href::parent_dir(doc_path);
    let mut changed = false;

    let out = EMBED_TAG.replace_all(text, |caps: &Captures| {
        let Some((value, _)) = quoted(caps, 1).or_else(|| quoted(caps, 3)) else {
            return caps[0].to_string();
        };
        if href::resolve(base, value).as_deref() != Some(svg_path) {
            return caps[0].to_string();
        }
        changed = true;
        format!(
            r#"<img alt="Cover" src="{}"/>"#,
            href::with_file_name(value, href::file_name(raster_path))
        )
    });

    if changed { Some(out.into_owned()) } else { None }
}

/// The raster image an SVG document embeds, if any.
pub fn svg_embedded_image(svg: &str) -> Option<String> {
    let caps = SVG_IMAGE_HREF.captures(svg)?;
    quoted(&caps, 1).map(|(value, _)| value.to_string())
}
