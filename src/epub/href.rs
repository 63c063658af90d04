//! Archive-path arithmetic for hrefs found in package and content documents.
//!
//! Archive paths are `/`-separated, relative to the zip root, with no
//! leading slash. Hrefs are URL references relative to the document that
//! contains them.

/// Directory part of an archive path, without a trailing slash.
pub fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Final path segment.
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Split `href` into its path and the `#fragment` / `?query` suffix.
pub fn split_suffix(href: &str) -> (&str, &str) {
    match href.find(['#', '?']) {
        Some(idx) => (&href[..idx], &href[idx..]),
        None => (href, ""),
    }
}

/// Whether `href` points outside the archive.
pub fn is_external(href: &str) -> bool {
    let lower = href.trim_start().to_ascii_lowercase();
    lower.contains("://") || lower.starts_with("data:") || lower.starts_with("mailto:")
}

/// Resolve `href`, found in a document under `base_dir`, to an archive path.
///
/// Returns `None` for external references, pure fragments, and paths that
/// climb above the archive root.
pub fn resolve(base_dir: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || is_external(href) {
        return None;
    }
    let (path, _) = split_suffix(href);
    if path.is_empty() {
        return None;
    }
    let path = urlencoding::decode(path).unwrap_or_else(|_| path.into());

    let mut segments: Vec<&str> = Vec::new();
    let joined;
    let full = if let Some(rooted) = path.strip_prefix('/') {
        rooted
    } else if base_dir.is_empty() {
        &*path
    } else {
        joined = format!("{}/{}", base_dir, path);
        joined.as_str()
    };

    for segment in full.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

/// Replace the file-name segment of `href`, keeping its directory prefix
/// and any fragment or query.
///
/// `Images/pic.png#top` with `pic.jpg` becomes `Images/pic.jpg#top`.
pub fn with_file_name(href: &str, new_name: &str) -> String {
    let (path, suffix) = split_suffix(href);
    let prefix = match path.rfind('/') {
        Some(idx) => &path[..idx + 1],
        None => "",
    };
    format!("{}{}{}", prefix, urlencoding::encode(new_name), suffix)
}

/// Swap the extension of an archive path's file name.
pub fn with_extension(path: &str, ext: &str) -> String {
    let name = file_name(path);
    let stem = match name.rfind('.') {
        Some(0) | None => name,
        Some(idx) => &name[..idx],
    };
    let dir = parent_dir(path);
    if dir.is_empty() {
        format!("{}.{}", stem, ext)
    } else {
        format!("{}/{}.{}", dir, stem, ext)
    }
}

/// Lowercased extension of a path, if any.
pub fn extension(path: &str) -> Option<String> {
    let name = file_name(path);
    match name.rfind('.') {
        Some(0) | None => None,
        Some(idx) => Some(name[idx + 1..].to_ascii_lowercase()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative() {
        assert_eq!(
            resolve("OEBPS/Text", "../Images/pic.png"),
            Some("OEBPS/Images/pic.png".to_string())
        );
        assert_eq!(
            resolve("OEBPS", "Images/pic.png#frag"),
            Some("OEBPS/Images/pic.png".to_string())
        );
        assert_eq!(resolve("", "./cover.png"), Some("cover.png".to_string()));
        assert_eq!(resolve("OEBPS", "/cover.png"), Some("cover.png".to_string()));
    }

    #[test]
    fn test_resolve_decodes_percent_escapes() {
        assert_eq!(
            resolve("OEBPS", "Images/my%20pic.png"),
            Some("OEBPS/Images/my pic.png".to_string())
        );
        assert_eq!(resolve("", "caf%C3%A9.png"), Some("café.png".to_string()));
    }

    #[test]
    fn test_resolve_rejects_outside_refs() {
        assert_eq!(resolve("OEBPS", "http://example.com/a.png"), None);
        assert_eq!(resolve("OEBPS", "data:image/png;base64,AAAA"), None);
        assert_eq!(resolve("OEBPS", "#note1"), None);
        assert_eq!(resolve("", "../escape.png"), None);
    }

    #[test]
    fn test_with_file_name_keeps_prefix_and_fragment() {
        assert_eq!(with_file_name("../Images/pic.png#top", "pic.jpg"), "../Images/pic.jpg#top");
        assert_eq!(with_file_name("pic.png", "pic.jpg"), "pic.jpg");
        assert_eq!(with_file_name("a/my pic.png", "my pic.jpg"), "a/my%20pic.jpg");
        assert_eq!(with_file_name("a/[1].png", "[1]<2>.jpg"), "a/%5B1%5D%3C2%3E.jpg");
        assert_eq!(with_file_name("a.png", "100%.jpg"), "100%25.jpg");
    }

    #[test]
    fn test_with_extension() {
        assert_eq!(with_extension("OEBPS/Images/pic.png", "jpg"), "OEBPS/Images/pic.jpg");
        assert_eq!(with_extension("cover.PNG", "jpg"), "cover.jpg");
        assert_eq!(with_extension("noext", "jpg"), "noext.jpg");
        assert_eq!(extension("a/b.WebP"), Some("webp".to_string()));
        assert_eq!(extension("a/.hidden"), None);
    }
}
