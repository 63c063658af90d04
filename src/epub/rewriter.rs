//! EPUB archive rewriter.
//!
//! Loads an archive, runs every eligible image through the transform
//! pipeline, and writes a new archive with converted images, an updated
//! package document and rewritten references. Unrecoverable problems abort
//! the rewrite and leave the source as the result; per-image problems only
//! keep that image's original bytes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::thread;

use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use crate::config::ConversionConfig;
use crate::core::models::{ConversionOutcome, ImageAsset};
use crate::epub::archive::{EpubArchive, Entry};
use crate::epub::href;
use crate::epub::markup::{self, ImageRename, RenameMap};
use crate::epub::opf::{ManifestItem, NewItem, PackageDocument};
use crate::error::{ArchiveError, ImageError};
use crate::imaging::{self, JPEG_MEDIA_TYPE, TransformOptions, TransformedImage};
use crate::logging::format_bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewriteOptions {
    pub enabled: bool,
    pub transform: TransformOptions,
}

impl RewriteOptions {
    pub fn from_config(config: &ConversionConfig) -> Self {
        Self {
            enabled: config.enabled,
            transform: TransformOptions::from_config(config),
        }
    }
}

/// Per-image result, keyed by the image's full archive path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageResult {
    pub asset: ImageAsset,
    pub outcome: ConversionOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RewriteStats {
    pub images_converted: usize,
    pub images_skipped: usize,
    pub images_failed: usize,
    /// Pages beyond the first produced by splitting wide images.
    pub pages_added: usize,
    pub svg_covers_fixed: usize,
    pub original_size: u64,
    pub new_size: u64,
}

#[derive(Debug, Clone)]
pub struct RewriteReport {
    /// Archive to use from here on: the rewritten one, or the source.
    pub output: PathBuf,
    pub images: Vec<ImageResult>,
    pub stats: RewriteStats,
}

impl RewriteReport {
    pub fn unchanged(source: &Path) -> Self {
        Self {
            output: source.to_path_buf(),
            images: Vec::new(),
            stats: RewriteStats::default(),
        }
    }

    pub fn outcome(&self, archive_path: &str) -> Option<&ConversionOutcome> {
        self.images
            .iter()
            .find(|r| r.asset.archive_path == archive_path)
            .map(|r| &r.outcome)
    }
}

/// `<stem>_baseline.epub` next to `source`.
pub fn default_output_path(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("book");
    source.with_file_name(format!("{}_baseline.epub", stem))
}

pub struct ArchiveRewriter {
    options: RewriteOptions,
}

enum JobKind {
    Raster,
    /// An SVG cover rasterized through the image it embeds.
    SvgCover { raster_path: String },
}

struct Job<'a> {
    item: &'a ManifestItem,
    path: String,
    media_type: String,
    kind: JobKind,
    /// Entry whose bytes are handed to the pipeline.
    input_path: String,
    input_media_type: String,
}

/// Where a converted image's pages landed.
struct Placement {
    job: usize,
    pages: Vec<String>,
}

impl ArchiveRewriter {
    pub fn new(options: RewriteOptions) -> Self {
        Self { options }
    }

    /// Rewrite `source` into `dest`.
    ///
    /// Never fails: when conversion is disabled or the archive cannot be
    /// processed, the report points back at `source` with no outcomes.
    pub fn rewrite(&self, source: &Path, dest: &Path) -> RewriteReport {
        if !self.options.enabled {
            debug!(source = %source.display(), "Conversion disabled");
            return RewriteReport::unchanged(source);
        }

        match self.try_rewrite(source, dest) {
            Ok(report) => report,
            Err(e) => {
                warn!(
                    source = %source.display(),
                    error = %e,
                    "Conversion failed, using original file"
                );
                RewriteReport::unchanged(source)
            }
        }
    }

    pub fn try_rewrite(&self, source: &Path, dest: &Path) -> Result<RewriteReport, ArchiveError> {
        let span = info_span!("rewrite", source = %source.display());
        let _enter = span.enter();

        let original_size = std::fs::metadata(source)?.len();
        let mut archive = EpubArchive::open(source)?;
        let opf_path = archive.package_path()?;
        let doc = PackageDocument::parse(&opf_path, archive.read_text(&opf_path)?)?;
        let cover_path = doc.cover_item().and_then(|c| doc.item_path(c));

        info!(
            entries = archive.entries.len(),
            manifest = doc.manifest.len(),
            cover = ?cover_path,
            quality = self.options.transform.jpeg_quality,
            light_novel = self.options.transform.light_novel_mode,
            "Converting"
        );

        let (jobs, mut images) = self.plan_jobs(&doc, &archive, cover_path.as_deref());
        let results = run_transforms(&archive, &jobs, &self.options.transform);

        let mut stats = RewriteStats {
            original_size,
            ..RewriteStats::default()
        };
        let mut taken: HashSet<String> = archive.entries.iter().map(|e| e.path.clone()).collect();
        let mut placements = Vec::new();
        let mut job_images = Vec::with_capacity(jobs.len());

        for (index, (job, result)) in jobs.iter().zip(&results).enumerate() {
            let mut asset = ImageAsset {
                archive_path: job.path.clone(),
                media_type: job.media_type.clone(),
                pixel_width: 0,
                pixel_height: 0,
            };

            let outcome = match result {
                Ok(transformed) => {
                    asset.pixel_width = transformed.source_width;
                    asset.pixel_height = transformed.source_height;
                    let pages = plan_names(job, transformed, &mut taken);
                    let outcome = ConversionOutcome::Converted {
                        new_path: pages[0].clone(),
                        new_media_type: JPEG_MEDIA_TYPE.to_string(),
                        extra_pages: pages[1..].to_vec(),
                    };
                    placements.push(Placement { job: index, pages });
                    outcome
                }
                Err(ImageError::Unsupported(reason)) => ConversionOutcome::Skipped {
                    reason: format!("unsupported media type {}", reason),
                },
                Err(e) => {
                    warn!(path = %job.path, error = %e, "Image conversion failed, keeping original");
                    ConversionOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            job_images.push(ImageResult { asset, outcome });
        }
        images.extend(job_images);

        let mut renames = RenameMap::new();
        let mut editor = doc.edit();
        let mut raster_cover: Option<(String, String, String)> = None;

        for placement in &placements {
            let job = &jobs[placement.job];
            let transformed = match &results[placement.job] {
                Ok(t) => t,
                Err(_) => continue,
            };

            match &job.kind {
                JobKind::Raster => {
                    place_pages(&mut archive, &job.path, &placement.pages, transformed);

                    for item in doc.manifest.iter().filter(|i| doc.item_path(i).as_deref() == Some(job.path.as_str())) {
                        let first_href = href::with_file_name(&item.href, href::file_name(&placement.pages[0]));
                        editor.retarget_item(&item.id, &first_href, JPEG_MEDIA_TYPE);

                        let mut new_items = Vec::new();
                        for (n, page) in placement.pages.iter().enumerate().skip(1) {
                            new_items.push(NewItem {
                                id: editor.unique_id(&format!("{}-part{}", item.id, n + 1)),
                                href: href::with_file_name(&item.href, href::file_name(page)),
                                media_type: JPEG_MEDIA_TYPE.to_string(),
                            });
                        }
                        if !new_items.is_empty() {
                            editor.insert_items_after(&item.id, &new_items);
                            let ids: Vec<String> = new_items.iter().map(|i| i.id.clone()).collect();
                            editor.insert_spine_refs_after(&item.id, &ids);
                        }
                    }

                    if placement.pages[0] != job.path || placement.pages.len() > 1 {
                        renames.insert(
                            job.path.clone(),
                            ImageRename {
                                new_path: placement.pages[0].clone(),
                                extra_pages: placement.pages[1..].to_vec(),
                            },
                        );
                    }
                    stats.images_converted += 1;
                    stats.pages_added += placement.pages.len() - 1;
                }
                JobKind::SvgCover { raster_path } => {
                    let jpg_path = placement.pages[0].clone();
                    insert_after(
                        &mut archive,
                        &job.path,
                        Entry::file(jpg_path.clone(), transformed.pages[0].clone()),
                    );
                    let id = editor.unique_id(&format!("{}-raster", job.item.id));
                    editor.insert_items_after(
                        &job.item.id,
                        &[NewItem {
                            id: id.clone(),
                            href: href::with_file_name(&job.item.href, href::file_name(&jpg_path)),
                            media_type: JPEG_MEDIA_TYPE.to_string(),
                        }],
                    );
                    debug!(svg = %job.path, raster = %raster_path, jpeg = %jpg_path, "Rasterized SVG cover");
                    raster_cover = Some((job.path.clone(), jpg_path, id));
                    stats.images_converted += 1;
                }
            }
        }

        // Content documents, stylesheets and NCX
        let mut inline_cover_fixed = false;
        for entry in archive.entries.iter_mut() {
            if entry.is_dir || entry.path == opf_path || !markup::is_reference_document(&entry.path) {
                continue;
            }
            let Ok(text) = std::str::from_utf8(&entry.data) else {
                debug!(path = %entry.path, "Skipping non-UTF-8 document");
                continue;
            };

            let mut current: Option<String> = None;
            let is_page = markup::is_content_document(&entry.path);

            if is_page
                && let Some((svg_path, jpg_path, _)) = &raster_cover
                && let Some(fixed) = markup::replace_svg_embeds(text, &entry.path, svg_path, jpg_path)
            {
                info!(page = %entry.path, "Replaced SVG cover embed with image");
                stats.svg_covers_fixed += 1;
                current = Some(fixed);
            }

            let page = current.as_deref().unwrap_or(text);
            if is_page
                && let Some(fixed) = markup::fix_inline_svg_cover(page, &entry.path, cover_path.as_deref())
            {
                info!(page = %entry.path, "Replaced inline SVG cover with image");
                stats.svg_covers_fixed += 1;
                inline_cover_fixed = true;
                current = Some(fixed);
            }

            let page = current.as_deref().unwrap_or(text);
            if let Some(rewritten) = markup::rewrite_references(page, &entry.path, &renames) {
                current = Some(rewritten);
            }

            if let Some(updated) = current {
                entry.data = updated.into_bytes();
            }
        }

        // Cover meta follows the raster cover
        if let Some((_, _, id)) = &raster_cover {
            if stats.svg_covers_fixed > 0 && editor.set_cover_meta(id) {
                info!(cover = %id, "Fixed cover meta");
            }
        } else if inline_cover_fixed {
            if let Some(cover) = doc.cover_item() {
                if editor.set_cover_meta(&cover.id) {
                    info!(cover = %cover.id, "Fixed cover meta");
                }
            }
        }

        if !editor.is_empty() {
            let updated = editor.finish();
            if let Some(pos) = archive.position(&opf_path) {
                archive.entries[pos].data = updated.into_bytes();
            }
        }

        for image in &images {
            match image.outcome {
                ConversionOutcome::Skipped { .. } => stats.images_skipped += 1,
                ConversionOutcome::Failed { .. } => stats.images_failed += 1,
                ConversionOutcome::Converted { .. } => {}
            }
        }

        stats.new_size = archive.write_atomic(dest)?;
        log_stats(&stats);

        Ok(RewriteReport {
            output: dest.to_path_buf(),
            images,
            stats,
        })
    }

    /// Pick the images to transform. Images that cannot be transformed are
    /// returned as already-decided results.
    fn plan_jobs<'a>(
        &self,
        doc: &'a PackageDocument,
        archive: &EpubArchive,
        cover_path: Option<&str>,
    ) -> (Vec<Job<'a>>, Vec<ImageResult>) {
        let mut jobs = Vec::new();
        let mut decided = Vec::new();
        let mut seen = HashSet::new();

        for item in doc.manifest.iter().filter(|i| i.is_image()) {
            let Some(path) = doc.item_path(item) else {
                continue;
            };
            if !seen.insert(path.clone()) {
                continue;
            }
            let skip = |reason: &str| ImageResult {
                asset: ImageAsset {
                    archive_path: path.clone(),
                    media_type: item.media_type.clone(),
                    pixel_width: 0,
                    pixel_height: 0,
                },
                outcome: ConversionOutcome::Skipped {
                    reason: reason.to_string(),
                },
            };

            let Some(entry) = archive.find(&path) else {
                warn!(path = %path, "Manifest item has no archive entry");
                decided.push(skip("missing from archive"));
                continue;
            };

            if imaging::is_convertible(&item.media_type) {
                jobs.push(Job {
                    item,
                    path: path.clone(),
                    media_type: item.media_type.clone(),
                    kind: JobKind::Raster,
                    input_path: path.clone(),
                    input_media_type: item.media_type.clone(),
                });
            } else if imaging::is_svg(&item.media_type) && cover_path == Some(path.as_str()) {
                match embedded_raster(doc, archive, &path, &entry.data) {
                    Some((raster_path, input_media_type)) => jobs.push(Job {
                        item,
                        path: path.clone(),
                        media_type: item.media_type.clone(),
                        kind: JobKind::SvgCover {
                            raster_path: raster_path.clone(),
                        },
                        input_path: raster_path,
                        input_media_type,
                    }),
                    None => decided.push(skip("vector svg cover")),
                }
            } else {
                decided.push(skip("not a convertible image"));
            }
        }

        debug!(jobs = jobs.len(), skipped = decided.len(), "Planned image conversions");
        (jobs, decided)
    }
}

/// The raster image an SVG cover embeds: its archive path and media type.
fn embedded_raster(
    doc: &PackageDocument,
    archive: &EpubArchive,
    svg_path: &str,
    svg: &[u8],
) -> Option<(String, String)> {
    let text = std::str::from_utf8(svg).ok()?;
    let raster_href = markup::svg_embedded_image(text)?;
    let raster_path = href::resolve(href::parent_dir(svg_path), &raster_href)?;
    if !archive.contains(&raster_path) {
        return None;
    }
    let media_type = doc
        .item_by_path(&raster_path)
        .map(|i| i.media_type.clone())
        .or_else(|| media_type_for_extension(&raster_path))?;
    Some((raster_path, media_type))
}

fn media_type_for_extension(path: &str) -> Option<String> {
    let media_type = match href::extension(path)?.as_str() {
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "jpg" | "jpeg" => JPEG_MEDIA_TYPE,
        _ => return None,
    };
    Some(media_type.to_string())
}

/// Transform every job, spreading them over the available cores. Results
/// come back in job order.
fn run_transforms(
    archive: &EpubArchive,
    jobs: &[Job<'_>],
    options: &TransformOptions,
) -> Vec<Result<TransformedImage, ImageError>> {
    if jobs.is_empty() {
        return Vec::new();
    }
    let workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(jobs.len());
    let per_worker = jobs.len().div_ceil(workers);

    let run = |job: &Job<'_>| {
        let options = match job.kind {
            // A cover is a single page
            JobKind::SvgCover { .. } => TransformOptions {
                light_novel_mode: false,
                ..*options
            },
            JobKind::Raster => *options,
        };
        match archive.find(&job.input_path) {
            Some(entry) => imaging::transform(&entry.data, &job.input_media_type, &options),
            None => Err(ImageError::Decode(format!("{} is missing", job.input_path))),
        }
    };

    thread::scope(|scope| {
        let handles: Vec<_> = jobs
            .chunks(per_worker)
            .map(|chunk| (chunk.len(), scope.spawn(move || chunk.iter().map(run).collect::<Vec<_>>())))
            .collect();

        handles
            .into_iter()
            .flat_map(|(len, handle)| match handle.join() {
                Ok(results) => results,
                Err(_) => (0..len)
                    .map(|_| Err(ImageError::Decode("image transform panicked".to_string())))
                    .collect(),
            })
            .collect()
    })
}

/// Choose archive paths for a transformed image's pages.
fn plan_names(job: &Job<'_>, transformed: &TransformedImage, taken: &mut HashSet<String>) -> Vec<String> {
    let keeps_path = matches!(job.kind, JobKind::Raster)
        && !transformed.is_split()
        && matches!(href::extension(&job.path).as_deref(), Some("jpg" | "jpeg"));
    if keeps_path {
        return vec![job.path.clone()];
    }

    if transformed.is_split() {
        let jpg_path = href::with_extension(&job.path, "jpg");
        let stem_path = jpg_path.strip_suffix(".jpg").unwrap_or(&jpg_path);
        (1..=transformed.pages.len())
            .map(|n| claim(taken, &format!("{}_part{}.jpg", stem_path, n)))
            .collect()
    } else {
        vec![claim(taken, &href::with_extension(&job.path, "jpg"))]
    }
}

/// Reserve `candidate`, or `<stem>-N.<ext>` when it is already taken.
fn claim(taken: &mut HashSet<String>, candidate: &str) -> String {
    let mut path = candidate.to_string();
    let mut n = 1;
    while taken.contains(&path) {
        let ext = href::extension(candidate).unwrap_or_default();
        let stem = candidate.strip_suffix(&format!(".{}", ext)).unwrap_or(candidate);
        path = format!("{}-{}.{}", stem, n, ext);
        n += 1;
    }
    taken.insert(path.clone());
    path
}

/// Swap an image entry for its converted pages, in place.
fn place_pages(archive: &mut EpubArchive, path: &str, pages: &[String], transformed: &TransformedImage) {
    let Some(pos) = archive.position(path) else {
        return;
    };
    let entry = &mut archive.entries[pos];
    entry.path = pages[0].clone();
    entry.data = transformed.pages[0].clone();
    entry.compressed = true;

    for (offset, (page, data)) in pages.iter().zip(&transformed.pages).enumerate().skip(1) {
        archive
            .entries
            .insert(pos + offset, Entry::file(page.clone(), data.clone()));
    }
}

fn insert_after(archive: &mut EpubArchive, anchor: &str, entry: Entry) {
    match archive.position(anchor) {
        Some(pos) => archive.entries.insert(pos + 1, entry),
        None => archive.entries.push(entry),
    }
}

fn log_stats(stats: &RewriteStats) {
    info!(
        converted = stats.images_converted,
        skipped = stats.images_skipped,
        failed = stats.images_failed,
        "Converted {} images",
        stats.images_converted
    );
    if stats.new_size <= stats.original_size {
        let saved = stats.original_size - stats.new_size;
        let pct = if stats.original_size > 0 {
            saved as f64 / stats.original_size as f64 * 100.0
        } else {
            0.0
        };
        info!("Saved {} ({:.1}%)", format_bytes(saved), pct);
    } else {
        info!("Size increased by {}", format_bytes(stats.new_size - stats.original_size));
    }
    if stats.pages_added > 0 {
        info!("Created {} additional pages from splits", stats.pages_added);
    }
    if stats.svg_covers_fixed > 0 {
        info!("Fixed {} SVG cover(s)", stats.svg_covers_fixed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_adds_suffix_on_collision() {
        let mut taken: HashSet<String> = ["OEBPS/pic.jpg".to_string()].into_iter().collect();
        assert_eq!(claim(&mut taken, "OEBPS/pic.jpg"), "OEBPS/pic-1.jpg");
        assert_eq!(claim(&mut taken, "OEBPS/pic.jpg"), "OEBPS/pic-2.jpg");
        assert_eq!(claim(&mut taken, "OEBPS/other.jpg"), "OEBPS/other.jpg");
    }

    #[test]
    fn test_default_output_path() {
        assert_eq!(
            default_output_path(Path::new("/books/My Book.epub")),
            PathBuf::from("/books/My Book_baseline.epub")
        );
    }

    #[test]
    fn test_disabled_returns_source() {
        let rewriter = ArchiveRewriter::new(RewriteOptions {
            enabled: false,
            transform: TransformOptions::default(),
        });
        let report = rewriter.rewrite(Path::new("/nope/book.epub"), Path::new("/nope/out.epub"));
        assert_eq!(report.output, PathBuf::from("/nope/book.epub"));
        assert!(report.images.is_empty());
    }

    #[test]
    fn test_unreadable_source_falls_back() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("broken.epub");
        std::fs::write(&source, b"not a zip").unwrap();
        let dest = temp.path().join("out.epub");

        let rewriter = ArchiveRewriter::new(RewriteOptions {
            enabled: true,
            transform: TransformOptions::default(),
        });
        let report = rewriter.rewrite(&source, &dest);

        assert_eq!(report.output, source);
        assert!(report.images.is_empty());
        assert!(!dest.exists());
    }

    #[test]
    fn test_media_type_for_extension() {
        assert_eq!(media_type_for_extension("a/b.PNG").as_deref(), Some("image/png"));
        assert_eq!(media_type_for_extension("a/b.svg"), None);
    }
}
