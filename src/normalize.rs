//! Tolerant value normalization and matching.
//!
//! Extracted values and ground-truth values rarely agree byte-for-byte:
//! currency symbols, entity encodings, and whitespace all vary between a
//! rendered page and a hand-labelled dataset. Comparison therefore happens
//! on a canonical form: entities decoded, lowercased, and stripped down to
//! ASCII letters and digits.

/// HTML entities decoded before comparison, in replacement order.
///
/// This is a fixed set; growing it changes match results across every
/// stored evaluation, so additions are a deliberate decision.
const ENTITIES: &[(&str, &str)] = &[
    ("&lt;", "<"),
    ("&gt;", ">"),
    ("&amp;", "&"),
    ("&quot;", "\""),
    ("&apos;", "'"),
    ("&nbsp;", " "),
    ("&ndash;", "\u{2013}"),
    ("&rsquo;", "\u{2019}"),
    ("&eacute;", "\u{e9}"),
    ("&frac12;", "\u{bd}"),
    ("&reg;", "\u{ae}"),
    ("&#39;", "'"),
    ("&#150;", "\u{2013}"),
    ("&#160;", " "),
    ("&#x27;", "'"),
    ("&#40;", "("),
    ("&#41;", ")"),
    ("&#47;", "/"),
    ("&#43;", "+"),
    ("&#035;", "#"),
    ("&#38;", "&"),
];

/// Raw strings that denote "no value" before any normalization.
const EMPTY_RAW: &[&str] = &["", "-", "None", "N/A", "n/a", "null", "(not found in JSON)"];

/// Normalized forms that denote "no value".
const EMPTY_NORMALIZED: &[&str] = &["", "none", "-", "null", "na", "notfound"];

/// Canonicalize a value for comparison.
///
/// Decodes the fixed entity set, lowercases, and drops every codepoint
/// outside ASCII `[a-z0-9]`.
///
/// ```
/// use pagesift::normalize::normalize;
/// assert_eq!(normalize("$32,520 \u{2013} $34,520"), "3252034520");
/// assert_eq!(normalize("iPhone 15 Pro"), "iphone15pro");
/// ```
pub fn normalize(value: &str) -> String {
    let mut text = value.to_string();
    for (entity, replacement) in ENTITIES {
        if text.contains(entity) {
            text = text.replace(entity, replacement);
        }
    }

    text.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .collect()
}

/// Whether a value belongs to the "absent" equivalence class.
///
/// Empty strings, `-`, `None`, `N/A`, `null`, and the literal
/// "(not found in JSON)" marker all count as no value.
pub fn is_empty_value(value: &str) -> bool {
    EMPTY_RAW.contains(&value) || EMPTY_NORMALIZED.contains(&normalize(value).as_str())
}

/// Tolerant comparison of an extracted value against ground truth.
///
/// Both absent matches; exactly one absent does not. Otherwise values match
/// when their normalized forms are equal, or when the normalized truth is a
/// substring of the normalized extraction (extractions often carry extra
/// context around the labelled value). The substring rule is directional:
/// `value_match(a, b)` does not imply `value_match(b, a)`.
pub fn value_match(extracted: &str, truth: &str) -> bool {
    let extracted_empty = is_empty_value(extracted);
    let truth_empty = is_empty_value(truth);

    if truth_empty && extracted_empty {
        return true;
    }
    if truth_empty != extracted_empty {
        return false;
    }

    let norm_extracted = normalize(extracted);
    let norm_truth = normalize(truth);

    norm_extracted == norm_truth || norm_extracted.contains(&norm_truth)
}
