//! Structural fingerprints for HTML documents.
//!
//! A fingerprint is the set of tag-path shingles over the DOM skeleton:
//! for every element, the path of ancestor tag names down to it (capped in
//! depth), hashed to a u64. Text content plays no part, so two pages with
//! the same template but different articles fingerprint identically.

use std::collections::HashSet;
use std::hash::{DefaultHasher, Hash, Hasher};

use ego_tree::NodeRef;
use scraper::{Html, Node};

/// Ancestor tags kept per path shingle. Deeper context than this mostly
/// repeats the template's outer shell and dilutes the signal.
const PATH_DEPTH: usize = 5;

/// Compute the structural fingerprint of one HTML document.
pub fn fingerprint(html: &str) -> HashSet<u64> {
    let document = Html::parse_document(html);
    let mut shingles = HashSet::new();
    let mut path: Vec<String> = Vec::new();
    collect(document.tree.root(), &mut path, &mut shingles);
    shingles
}

fn collect(node: NodeRef<'_, Node>, path: &mut Vec<String>, shingles: &mut HashSet<u64>) {
    for child in node.children() {
        let Some(element) = child.value().as_element() else {
            continue;
        };
        let name = element.name().to_ascii_lowercase();
        if matches!(name.as_str(), "script" | "style" | "noscript") {
            continue;
        }

        path.push(name);
        let start = path.len().saturating_sub(PATH_DEPTH);
        let shingle = path[start..].join("/");
        let mut hasher = DefaultHasher::new();
        shingle.hash(&mut hasher);
        shingles.insert(hasher.finish());

        collect(child, path, shingles);
        path.pop();
    }
}

/// Jaccard similarity of two fingerprints. Two empty fingerprints (pages
/// with no elements at all) count as identical.
pub fn jaccard(a: &HashSet<u64>, b: &HashSet<u64>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        1.0
    } else {
        intersection as f64 / union as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_changes_do_not_change_the_fingerprint() {
        let a = fingerprint("<html><body><h1>Dune</h1><p>one</p></body></html>");
        let b = fingerprint("<html><body><h1>Foundation</h1><p>two</p></body></html>");
        assert_eq!(a, b);
    }

    #[test]
    fn different_structures_differ() {
        let a = fingerprint("<html><body><ul><li>x</li></ul></body></html>");
        let b = fingerprint("<html><body><table><tr><td>x</td></tr></table></body></html>");
        assert_ne!(a, b);
        assert!(jaccard(&a, &b) < 1.0);
    }

    #[test]
    fn scripts_and_styles_are_skipped() {
        let bare = fingerprint("<html><body><p>x</p></body></html>");
        let noisy = fingerprint(
            "<html><body><script>let x=1;</script><style>p{}</style><p>x</p></body></html>",
        );
        assert_eq!(bare, noisy);
    }

    #[test]
    fn jaccard_bounds() {
        let a = fingerprint("<html><body><p>x</p></body></html>");
        assert_eq!(jaccard(&a, &a), 1.0);
        assert_eq!(jaccard(&HashSet::new(), &HashSet::new()), 1.0);
        assert_eq!(jaccard(&a, &HashSet::new()), 0.0);
    }
}
