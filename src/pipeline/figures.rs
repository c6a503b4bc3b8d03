//! Figure extraction: correlate markdown image references with image files
//! and the parser's structured content list.
//!
//! ## Passes
//!
//! 1. **Structured pre-pass** (only with a content list). Image items are
//!    visited in list order. A label is read from the item's caption; an
//!    unlabelled item inherits the previous image item's label when both sit
//!    on the same page and their boxes overlap vertically by more than 30 %
//!    of the previous box's height (sub-panels split into several blocks).
//!    The result is a file-name → metadata map; the first entry for a file
//!    name wins.
//! 2. **Markdown scan**. Every local `![caption](path)` reference becomes a
//!    candidate. Its provisional label comes from, in order: the structured
//!    map, the inline caption, the text in the 100 characters before the
//!    reference (never reaching back past the previous image), or a running
//!    `Figure <n>` counter.
//! 3. Candidates are sorted by their byte offset in the markdown. That
//!    offset is the only ordering key; discovery order is irrelevant.
//!
//! Labels produced here are provisional. [`super::canonical`] assigns the
//! final `F<n>` labels.

use super::inventory::ImageFile;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tracing::debug;

/// Characters of markdown inspected before an image reference.
const CONTEXT_WINDOW_CHARS: usize = 100;

/// Fraction of the previous box's height two boxes must share to merge labels.
const OVERLAP_THRESHOLD: f64 = 0.3;

static RE_FIGURE_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:Fig(?:ure)?\.?|图)\s*([0-9]+[A-Za-z]?)").unwrap());

static RE_INLINE_IMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"!\[([^\]]*)\]\(\s*<?([^)\s>]+)>?(?:\s+"[^"]*")?\s*\)"#).unwrap());

/// One item of the parser's structured content list.
///
/// Only image items matter here; every other field is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContentItem {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub img_path: Option<String>,
    #[serde(default)]
    pub page_idx: Option<u32>,
    #[serde(default)]
    pub image_caption: Vec<String>,
    #[serde(default)]
    pub bbox: Option<Vec<f64>>,
}

impl ContentItem {
    fn is_image(&self) -> bool {
        self.kind == "image" && self.img_path.is_some()
    }

    fn caption_text(&self) -> String {
        self.image_caption
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn vertical_span(&self) -> Option<(f64, f64)> {
        match self.bbox.as_deref() {
            Some([_, y0, _, y1]) => Some((y0.min(*y1), y0.max(*y1))),
            _ => None,
        }
    }
}

/// Where a candidate's provisional label came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelSource {
    Structured,
    Caption,
    Context,
    Sequential,
}

/// A figure before canonical renumbering. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFigureCandidate {
    /// Provisional label such as `Figure 3a`.
    pub label: String,
    pub label_source: LabelSource,
    pub caption: String,
    /// Resolved image on disk; `None` when the bundle lacks the file.
    pub image_path: Option<PathBuf>,
    pub file_name: String,
    /// 1-based page, when known.
    pub page: Option<u32>,
    /// Byte offset of the reference in the markdown. Sort key.
    pub offset: usize,
}

#[derive(Debug, Clone)]
struct StructuredMeta {
    label: Option<String>,
    caption: String,
    page: Option<u32>,
}

/// Find a figure label (`Fig. 2`, `Figure 3a`, `图4`) and render it as `Figure <n>`.
pub fn find_label(text: &str) -> Option<String> {
    RE_FIGURE_LABEL
        .captures(text)
        .map(|caps| format!("Figure {}", &caps[1]))
}

/// Last path segment of an image reference.
pub fn reference_file_name(target: &str) -> &str {
    let trimmed = target.split(['?', '#']).next().unwrap_or(target);
    trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed)
}

fn is_remote_reference(target: &str) -> bool {
    let t = target.to_ascii_lowercase();
    t.starts_with("http://") || t.starts_with("https://") || t.starts_with("data:")
}

/// Run the three passes and return candidates in markdown order.
pub fn extract_figures(
    markdown: &str,
    images: &[ImageFile],
    content_list: Option<&[ContentItem]>,
) -> Vec<RawFigureCandidate> {
    let structured = content_list.map(structured_prepass).unwrap_or_default();
    let by_name: HashMap<&str, &ImageFile> = images
        .iter()
        .map(|img| (img.file_name.as_str(), img))
        .collect();

    let mut candidates = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut unlabeled = 0u32;
    let mut previous_end = 0usize;

    for caps in RE_INLINE_IMAGE.captures_iter(markdown) {
        let Some(whole) = caps.get(0) else { continue };
        let offset = whole.start();
        let window_floor = previous_end;
        previous_end = whole.end();

        let target = &caps[2];
        if is_remote_reference(target) {
            continue;
        }
        let file_name = reference_file_name(target).to_string();
        if file_name.is_empty() || !seen.insert(file_name.clone()) {
            continue;
        }

        let inline_caption = caps[1].trim().to_string();
        let meta = structured.get(&file_name);
        let image = by_name.get(file_name.as_str()).copied();

        let (label, label_source) =
            if let Some(label) = meta.and_then(|m| m.label.clone()) {
                (label, LabelSource::Structured)
            } else if let Some(label) = find_label(&inline_caption) {
                (label, LabelSource::Caption)
            } else if let Some(label) =
                find_label(preceding_context(markdown, offset, window_floor))
            {
                (label, LabelSource::Context)
            } else {
                unlabeled += 1;
                (format!("Figure {unlabeled}"), LabelSource::Sequential)
            };

        let caption = if !inline_caption.is_empty() {
            inline_caption
        } else {
            meta.map(|m| m.caption.clone()).unwrap_or_default()
        };

        let page = meta
            .and_then(|m| m.page)
            .or_else(|| image.and_then(|i| i.page));

        if image.is_none() {
            debug!("Image reference '{}' has no file in the bundle", file_name);
        }

        candidates.push(RawFigureCandidate {
            label,
            label_source,
            caption,
            image_path: image.map(|i| i.path.clone()),
            file_name,
            page,
            offset,
        });
    }

    candidates.sort_by_key(|c| c.offset);
    candidates
}

/// The text before `offset`, at most [`CONTEXT_WINDOW_CHARS`] characters and
/// never earlier than `floor`.
fn preceding_context(markdown: &str, offset: usize, floor: usize) -> &str {
    let before = &markdown[floor..offset];
    let start = before
        .char_indices()
        .rev()
        .nth(CONTEXT_WINDOW_CHARS - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &before[start..]
}

fn structured_prepass(items: &[ContentItem]) -> HashMap<String, StructuredMeta> {
    let mut map: HashMap<String, StructuredMeta> = HashMap::new();
    let mut previous: Option<(&ContentItem, Option<String>)> = None;

    for item in items.iter().filter(|i| i.is_image()) {
        let caption = item.caption_text();
        let mut label = find_label(&caption);

        if label.is_none() {
            if let Some((prev, prev_label)) = &previous {
                if prev_label.is_some() && same_page(prev, item) && overlaps(prev, item) {
                    label = prev_label.clone();
                }
            }
        }

        if let Some(path) = item.img_path.as_deref() {
            let name = reference_file_name(path).to_string();
            map.entry(name).or_insert_with(|| StructuredMeta {
                label: label.clone(),
                caption: caption.clone(),
                page: item.page_idx.map(|p| p + 1),
            });
        }

        previous = Some((item, label));
    }

    debug!("Structured pre-pass mapped {} image files", map.len());
    map
}

fn same_page(a: &ContentItem, b: &ContentItem) -> bool {
    a.page_idx.is_some() && a.page_idx == b.page_idx
}

fn overlaps(prev: &ContentItem, current: &ContentItem) -> bool {
    let (Some((p0, p1)), Some((c0, c1))) = (prev.vertical_span(), current.vertical_span()) else {
        return false;
    };
    let prev_height = p1 - p0;
    if prev_height <= 0.0 {
        return false;
    }
    let shared = p1.min(c1) - p0.max(c0);
    shared > OVERLAP_THRESHOLD * prev_height
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(name: &str) -> ImageFile {
        ImageFile {
            file_name: name.to_string(),
            path: PathBuf::from(format!("/bundle/images/{name}")),
            page: None,
            index: None,
            size: 10,
        }
    }

    fn item(path: &str, page: u32, caption: &[&str], bbox: [f64; 4]) -> ContentItem {
        ContentItem {
            kind: "image".into(),
            img_path: Some(format!("images/{path}")),
            page_idx: Some(page),
            image_caption: caption.iter().map(|s| s.to_string()).collect(),
            bbox: Some(bbox.to_vec()),
        }
    }

    #[test]
    fn finds_labels_in_various_forms() {
        assert_eq!(find_label("Fig. 2 result").as_deref(), Some("Figure 2"));
        assert_eq!(find_label("see Figure 3a").as_deref(), Some("Figure 3a"));
        assert_eq!(find_label("Figure 10B: overview").as_deref(), Some("Figure 10B"));
        assert_eq!(find_label("图4 结构").as_deref(), Some("Figure 4"));
        assert_eq!(find_label("a configuration"), None);
    }

    #[test]
    fn lowercase_prose_is_not_a_label() {
        assert_eq!(find_label("We use the config 2 setup"), None);
        assert_eq!(find_label("a transfig 1 pass"), None);
        assert_eq!(find_label("FIG 10"), None);

        let md = "We use the config 2 setup here.\n\n![](images/a.jpg)";
        let figs = extract_figures(md, &[image("a.jpg")], None);
        assert_eq!(figs[0].label_source, LabelSource::Sequential);
        assert_eq!(figs[0].label, "Figure 1");
    }

    #[test]
    fn markdown_only_scenario() {
        let md = "intro ![Fig. 2 result](img_0_1.png) more text ![](img_0_2.png)";
        let images = vec![image("img_0_1.png"), image("img_0_2.png")];
        let figs = extract_figures(md, &images, None);

        assert_eq!(figs.len(), 2);
        assert_eq!(figs[0].label, "Figure 2");
        assert_eq!(figs[0].label_source, LabelSource::Caption);
        assert_eq!(figs[0].caption, "Fig. 2 result");
        assert_eq!(figs[1].label_source, LabelSource::Sequential);
        assert_eq!(figs[1].label, "Figure 1");
        assert_eq!(figs[1].caption, "");
        assert!(figs[0].offset < figs[1].offset);
        assert!(figs[1].image_path.is_some());
    }

    #[test]
    fn context_label_from_preceding_text() {
        let md = "As shown in Figure 7 below:\n\n![](images/a.jpg)";
        let figs = extract_figures(md, &[image("a.jpg")], None);
        assert_eq!(figs[0].label, "Figure 7");
        assert_eq!(figs[0].label_source, LabelSource::Context);
    }

    #[test]
    fn context_window_is_limited_to_100_chars() {
        let filler = "x".repeat(150);
        let md = format!("Figure 9 {filler}![](images/a.jpg)");
        let figs = extract_figures(&md, &[image("a.jpg")], None);
        assert_eq!(figs[0].label_source, LabelSource::Sequential);
    }

    #[test]
    fn structured_label_wins_and_markdown_caption_preferred() {
        let md = "![Overview of the pipeline](images/a.jpg)";
        let list = vec![item("a.jpg", 2, &["Figure 5. Pipeline"], [0.0, 10.0, 100.0, 60.0])];
        let figs = extract_figures(md, &[image("a.jpg")], Some(&list));
        assert_eq!(figs[0].label, "Figure 5");
        assert_eq!(figs[0].label_source, LabelSource::Structured);
        assert_eq!(figs[0].caption, "Overview of the pipeline");
        assert_eq!(figs[0].page, Some(3));
    }

    #[test]
    fn structured_caption_used_when_markdown_has_none() {
        let md = "![](images/a.jpg)";
        let list = vec![item("a.jpg", 0, &["Figure 1: Setup"], [0.0, 0.0, 1.0, 1.0])];
        let figs = extract_figures(md, &[image("a.jpg")], Some(&list));
        assert_eq!(figs[0].caption, "Figure 1: Setup");
    }

    #[test]
    fn overlapping_subpanel_inherits_label() {
        let md = "![](images/a.jpg)\n![](images/b.jpg)";
        let list = vec![
            item("a.jpg", 1, &["Figure 4 (left)"], [0.0, 100.0, 200.0, 300.0]),
            // shares 150 of the previous 200 units
            item("b.jpg", 1, &[], [210.0, 150.0, 400.0, 320.0]),
        ];
        let figs = extract_figures(md, &[image("a.jpg"), image("b.jpg")], Some(&list));
        assert_eq!(figs[1].label, "Figure 4");
        assert_eq!(figs[1].label_source, LabelSource::Structured);
    }

    #[test]
    fn no_inheritance_across_pages_or_small_overlap() {
        let md = "![](images/a.jpg)\n![](images/b.jpg)\n![](images/c.jpg)";
        let list = vec![
            item("a.jpg", 1, &["Figure 4"], [0.0, 100.0, 200.0, 300.0]),
            // 20 units of 200 shared: below threshold
            item("b.jpg", 1, &[], [0.0, 280.0, 200.0, 400.0]),
            item("c.jpg", 2, &[], [0.0, 280.0, 200.0, 400.0]),
        ];
        let images = vec![image("a.jpg"), image("b.jpg"), image("c.jpg")];
        let figs = extract_figures(md, &images, Some(&list));
        assert_eq!(figs[1].label_source, LabelSource::Sequential);
        assert_eq!(figs[2].label_source, LabelSource::Sequential);
        assert_eq!(figs[1].label, "Figure 1");
        assert_eq!(figs[2].label, "Figure 2");
    }

    #[test]
    fn order_follows_markdown_not_content_list() {
        let md = "![](images/b.jpg) text ![](images/a.jpg)";
        let images = vec![image("a.jpg"), image("b.jpg")];
        let list = vec![
            item("a.jpg", 0, &["Figure 1"], [0.0, 0.0, 1.0, 1.0]),
            item("b.jpg", 3, &["Figure 2"], [0.0, 0.0, 1.0, 1.0]),
        ];
        let mut reversed = list.clone();
        reversed.reverse();

        let forward = extract_figures(md, &images, Some(&list));
        let backward = extract_figures(md, &images, Some(&reversed));
        let names = |v: &[RawFigureCandidate]| {
            v.iter().map(|c| c.file_name.clone()).collect::<Vec<_>>()
        };
        assert_eq!(names(&forward), vec!["b.jpg", "a.jpg"]);
        assert_eq!(names(&forward), names(&backward));
    }

    #[test]
    fn duplicate_file_names_keep_first_structured_entry() {
        let md = "![](images/a.jpg)";
        let list = vec![
            item("a.jpg", 0, &["Figure 1"], [0.0, 0.0, 1.0, 1.0]),
            item("a.jpg", 5, &["Figure 9"], [0.0, 0.0, 1.0, 1.0]),
        ];
        let figs = extract_figures(md, &[image("a.jpg")], Some(&list));
        assert_eq!(figs[0].label, "Figure 1");
        assert_eq!(figs[0].page, Some(1));
    }

    #[test]
    fn skips_remote_and_repeated_references() {
        let md = "![a](https://example.org/x.png) ![b](images/a.jpg) ![c](images/a.jpg)";
        let figs = extract_figures(md, &[image("a.jpg")], None);
        assert_eq!(figs.len(), 1);
        assert_eq!(figs[0].caption, "b");
    }

    #[test]
    fn missing_image_file_still_yields_candidate() {
        let md = "![Figure 2](images/gone.jpg)";
        let figs = extract_figures(md, &[], None);
        assert_eq!(figs.len(), 1);
        assert!(figs[0].image_path.is_none());
    }

    #[test]
    fn context_window_respects_char_boundaries() {
        let prefix = "图".repeat(120);
        let md = format!("{prefix}![](images/a.jpg)");
        let figs = extract_figures(&md, &[image("a.jpg")], None);
        assert_eq!(figs.len(), 1);
    }

    #[test]
    fn content_item_deserialises_parser_json() {
        let json = r#"[{"type":"image","img_path":"images/x.jpg","image_caption":["Fig. 1"],"image_footnote":[],"bbox":[1,2,3,4],"page_idx":0},
                       {"type":"text","text":"hello","page_idx":0}]"#;
        let items: Vec<ContentItem> = serde_json::from_str(json).unwrap();
        assert!(items[0].is_image());
        assert!(!items[1].is_image());
        assert_eq!(items[0].caption_text(), "Fig. 1");
    }
}
