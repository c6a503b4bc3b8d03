//! Deterministic cleanup of parser markdown before it is stored.
//!
//! Runs before figure extraction so the offsets the figure engine records
//! refer to the exact text that ends up in the store. Only whitespace and
//! invisible characters are touched; image references pass through intact.
//!
//! Applied in one pass over the lines:
//! - `\r\n` and lone `\r` become `\n`
//! - zero-width characters, BOM and soft hyphens are dropped
//! - trailing whitespace is trimmed
//! - leading blank lines are dropped and blank runs are capped at two
//! - the result ends with exactly one newline (or is empty)

/// Longest run of blank lines kept between two non-blank lines.
const MAX_BLANK_RUN: usize = 2;

fn is_invisible(c: char) -> bool {
    matches!(
        c,
        '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}'
    )
}

pub fn normalize_markdown(input: &str) -> String {
    let unified = input.replace("\r\n", "\n").replace('\r', "\n");

    let mut out = String::with_capacity(unified.len());
    let mut pending_blank = 0usize;
    let mut seen_content = false;

    for raw in unified.split('\n') {
        let line: String = raw.chars().filter(|c| !is_invisible(*c)).collect();
        let line = line.trim_end();

        if line.is_empty() {
            pending_blank += 1;
            continue;
        }
        if seen_content {
            out.push('\n');
            for _ in 0..pending_blank.min(MAX_BLANK_RUN) {
                out.push('\n');
            }
        }
        out.push_str(line);
        pending_blank = 0;
        seen_content = true;
    }

    if seen_content {
        out.push('\n');
    }
    out
}
