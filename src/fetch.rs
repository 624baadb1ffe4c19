//! HTML fetching and simplification.
//!
//! The pipeline never looks at raw page source directly: every document is
//! reduced to a simplified skeleton (structure and visible text, no
//! scripts, no styling noise) before the model or the executor sees it.
//! Fetching itself is behind a trait so tests and future remote fetchers
//! can plug in; the shipped implementation reads from the filesystem.

use std::path::Path;

use async_trait::async_trait;
use ego_tree::NodeRef;
use scraper::{Html, Node};

use crate::corpus::doc_id;
use crate::error::{PipelineError, Result};

/// A fetched document: the raw source plus its simplified form.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub id: String,
    pub original_html: String,
    pub simplified_html: String,
}

/// Resolve a target (today: a filesystem path) to a document.
#[async_trait]
pub trait HtmlFetcher: Send + Sync {
    async fn fetch(&self, target: &str) -> Result<FetchedDocument>;
}

/// Filesystem fetcher. URL targets are rejected; remote fetching lives
/// outside this crate.
pub struct FileFetcher;

#[async_trait]
impl HtmlFetcher for FileFetcher {
    async fn fetch(&self, target: &str) -> Result<FetchedDocument> {
        if target.starts_with("http://") || target.starts_with("https://") {
            return Err(PipelineError::Fetch {
                target: target.to_string(),
                reason: "remote fetching is not supported by the file fetcher".to_string(),
            });
        }

        let path = Path::new(target);
        let original_html =
            std::fs::read_to_string(path).map_err(|e| PipelineError::Fetch {
                target: target.to_string(),
                reason: e.to_string(),
            })?;
        let simplified_html = simplify_html(&original_html);

        Ok(FetchedDocument {
            id: doc_id(path),
            original_html,
            simplified_html,
        })
    }
}

/// Attributes worth keeping in the simplified skeleton. Identity and link
/// targets carry most of the locator signal; everything else is noise.
const KEPT_ATTRS: &[&str] = &["id", "class", "href"];

/// Tags whose entire subtree is dropped.
const DROPPED_TAGS: &[&str] = &["script", "style", "noscript", "iframe", "svg", "template"];

/// Longest run of text kept from a single text node.
const MAX_TEXT_LEN: usize = 160;

/// Hard cap on simplified output size.
const MAX_OUTPUT_LEN: usize = 200_000;

/// Reduce an HTML document to its structural skeleton.
///
/// Keeps element structure, id/class/href attributes, and
/// whitespace-collapsed text (truncated per node); drops scripts, styles,
/// comments, and embedded vector/frame content. The result is still valid
/// HTML, so locators learned against it evaluate with a normal selector
/// engine.
pub fn simplify_html(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut out = String::new();
    render(document.tree.root(), &mut out);
    out
}

fn render(node: NodeRef<'_, Node>, out: &mut String) {
    for child in node.children() {
        if out.len() >= MAX_OUTPUT_LEN {
            return;
        }
        match child.value() {
            Node::Element(element) => {
                let name = element.name().to_ascii_lowercase();
                if DROPPED_TAGS.contains(&name.as_str()) {
                    continue;
                }

                out.push('<');
                out.push_str(&name);
                for attr in KEPT_ATTRS {
                    if let Some(value) = element.attr(attr) {
                        if !value.is_empty() {
                            out.push_str(&format!(" {attr}=\"{}\"", value.replace('"', "&quot;")));
                        }
                    }
                }
                out.push('>');
                render(child, out);
                out.push_str(&format!("</{name}>"));
            }
            Node::Text(text) => {
                let collapsed = collapse_whitespace(&text.text);
                if collapsed.is_empty() {
                    continue;
                }
                out.push_str(&truncate(&collapsed, MAX_TEXT_LEN));
            }
            // Comments, doctypes, and processing instructions are noise.
            _ => {}
        }
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut end = max_len;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
