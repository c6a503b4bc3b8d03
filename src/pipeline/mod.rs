//! Document ingestion stages.
//!
//! Each submodule implements one step. The remote path turns a PDF into
//! canonically labelled figures:
//!
//! ```text
//! remote ──▶ bundle ──▶ normalize ──▶ figures ──▶ canonical
//! (batch API) (ZIP walk)  (cleanup)   (candidates)  (F1..FN)
//! ```
//!
//! 1. [`remote`]    — submit, upload, poll and download against the parsing
//!    service; outbound lookups go through [`dns`]
//! 2. [`bundle`]    — unpack the result ZIP and locate markdown, images and
//!    the structured content list; images are listed by [`inventory`]
//! 3. [`normalize`] — deterministic markdown cleanup before offsets are taken
//! 4. [`figures`]   — correlate image references with labels and captions
//! 5. [`canonical`] — renumber in markdown order, name files, label lookup
//!
//! [`text`] extracts plain text at upload time and [`encode`] prepares figure
//! images for multimodal prompts.

pub mod bundle;
pub mod canonical;
pub mod dns;
pub mod encode;
pub mod figures;
pub mod inventory;
pub mod normalize;
pub mod remote;
pub mod text;
