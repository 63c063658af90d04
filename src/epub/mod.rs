//! EPUB handling: archive I/O, package document edits, reference rewriting
//! and the end-to-end rewriter that ties them to the image pipeline.

pub mod archive;
pub mod href;
pub mod markup;
pub mod opf;
pub mod rewriter;

pub use archive::EpubArchive;
pub use opf::PackageDocument;
pub use rewriter::{ArchiveRewriter, RewriteOptions, RewriteReport, RewriteStats, default_output_path};
