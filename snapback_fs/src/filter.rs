//! Pre-compiled include/exclude rules the directory walker consults per
//! child.
//!
//! The ordered filter list from the client configuration is normalised into
//! a node-per-path-component tree plus a flat list of glob patterns. The
//! tree is pruned so that a node only survives where it changes the
//! effective filter type relative to its parent.

use std::collections::BTreeMap;
use std::path::{Component, Path};
use std::sync::Arc;

use snapback_core::{Error, Filter, FilterType, Result};

#[derive(Debug, Clone, Default)]
pub struct FilterNode {
    /// Override of the effective type at this path; `None` inherits the
    /// parent's effective type.
    pub filter_type: Option<FilterType>,
    pub exceptions: BTreeMap<String, FilterNode>,
}

/// Compile the ordered filter list into `(patterns, tree)`.
///
/// `pattern_exclude` entries become glob patterns applied name-by-name
/// during enumeration; everything else lands in the path tree. The root
/// inherits `include`.
pub fn normalize_filters(filters: &[Filter]) -> Result<(Vec<glob::Pattern>, FilterNode)> {
    let mut root = FilterNode {
        filter_type: Some(FilterType::Include),
        exceptions: BTreeMap::new(),
    };
    let mut patterns = Vec::new();
    build_tree(&mut root, &mut patterns, filters)?;
    prune_redundant_filters(&mut root, FilterType::Include);
    Ok((patterns, root))
}

fn build_tree(
    tree_root: &mut FilterNode,
    patterns: &mut Vec<glob::Pattern>,
    filters: &[Filter],
) -> Result<()> {
    for filter_item in filters {
        if filter_item.filter_type == FilterType::PatternExclude {
            let pattern = glob::Pattern::new(&filter_item.path).map_err(|err| {
                Error::InvalidArguments(format!("bad filter pattern {:?}: {err}", filter_item.path))
            })?;
            patterns.push(pattern);
            continue;
        }
        if filter_item.path == "." {
            tree_root.filter_type = Some(filter_item.filter_type);
            continue;
        }

        let mut components = Vec::new();
        for component in Path::new(&filter_item.path).components() {
            match component {
                Component::Normal(name) => match name.to_str() {
                    Some(name) => components.push(name.to_string()),
                    None => {
                        return Err(Error::InvalidArguments(format!(
                            "filter path is not valid UTF-8: {:?}",
                            filter_item.path
                        )));
                    }
                },
                Component::CurDir => {}
                _ => {
                    return Err(Error::InvalidArguments(format!(
                        "filter path must be relative: {:?}",
                        filter_item.path
                    )));
                }
            }
        }
        let Some((leaf, parents)) = components.split_last() else {
            tree_root.filter_type = Some(filter_item.filter_type);
            continue;
        };

        let mut position = &mut *tree_root;
        for directory in parents {
            let inherited = position.filter_type;
            position = position
                .exceptions
                .entry(directory.clone())
                .or_insert_with(|| FilterNode {
                    filter_type: inherited,
                    exceptions: BTreeMap::new(),
                });
        }
        position
            .exceptions
            .entry(leaf.clone())
            .or_default()
            .filter_type = Some(filter_item.filter_type);
    }
    Ok(())
}

/// It's perfectly legitimate for a user to configure redundant filters,
/// such as excluding a directory inside another that is already excluded.
/// Removing them before scanning keeps the per-child query trivial.
fn prune_redundant_filters(filters: &mut FilterNode, parent_type: FilterType) {
    if filters.filter_type == Some(parent_type) {
        // Same effect as the parent; let the node propagate instead.
        filters.filter_type = None;
    }
    let effective = filters.filter_type.unwrap_or(parent_type);
    filters.exceptions.retain(|_, child| {
        prune_redundant_filters(child, effective);
        child.filter_type.is_some() || !child.exceptions.is_empty()
    });
}

/// The walker's view of the filter tree at one directory: the node for this
/// path (if any rule mentions it) plus the effective type inherited from
/// above.
#[derive(Debug, Clone)]
pub struct FilterView {
    node: Option<Arc<FilterNode>>,
    effective: FilterType,
}

impl FilterView {
    pub fn root(node: FilterNode) -> Self {
        let effective = node.filter_type.unwrap_or(FilterType::Include);
        FilterView {
            node: Some(Arc::new(node)),
            effective,
        }
    }

    /// The view a child explorer carries.
    pub fn descend(&self, name: &str) -> FilterView {
        let child = self
            .node
            .as_ref()
            .and_then(|node| node.exceptions.get(name));
        match child {
            Some(child) => FilterView {
                effective: child.filter_type.unwrap_or(self.effective),
                node: Some(Arc::new(child.clone())),
            },
            None => FilterView {
                node: None,
                effective: self.effective,
            },
        }
    }

    /// A child is excluded iff its effective type is `exclude` and no
    /// included descendant needs the walker to enter it.
    pub fn child_excluded(&self, name: &str) -> bool {
        let child = self
            .node
            .as_ref()
            .and_then(|node| node.exceptions.get(name));
        let effective = child
            .and_then(|child| child.filter_type)
            .unwrap_or(self.effective);
        effective == FilterType::Exclude && child.is_none_or(|child| child.exceptions.is_empty())
    }

    /// True when this whole subtree is excluded with no exceptions.
    pub fn fully_excluded(&self) -> bool {
        self.effective == FilterType::Exclude
            && self
                .node
                .as_ref()
                .is_none_or(|node| node.exceptions.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn include(path: &str) -> Filter {
        Filter::new(FilterType::Include, path)
    }

    fn exclude(path: &str) -> Filter {
        Filter::new(FilterType::Exclude, path)
    }

    #[test]
    fn no_filters_include_everything() {
        let (patterns, tree) = normalize_filters(&[]).unwrap();
        assert!(patterns.is_empty());
        let view = FilterView::root(tree);
        assert!(!view.child_excluded("anything"));
        assert!(!view.fully_excluded());
    }

    #[test]
    fn plain_exclusion() {
        let (_, tree) = normalize_filters(&[exclude("a")]).unwrap();
        let view = FilterView::root(tree);
        assert!(view.child_excluded("a"));
        assert!(!view.child_excluded("b"));
    }

    #[test]
    fn exclusion_with_included_descendant_is_entered() {
        let (_, tree) = normalize_filters(&[exclude("c"), include("c/d/e")]).unwrap();
        let view = FilterView::root(tree);

        // "c" leads to an inclusion so the walker enters it.
        assert!(!view.child_excluded("c"));

        let c = view.descend("c");
        assert!(!c.child_excluded("d"));
        // Siblings inside "c" stay excluded.
        assert!(c.child_excluded("hidden"));

        let d = c.descend("d");
        assert!(!d.child_excluded("e"));
        let e = d.descend("e");
        assert!(!e.child_excluded("grandchild"));
    }

    #[test]
    fn redundant_filters_are_pruned() {
        // Excluding inside an exclusion changes nothing; the node must not
        // force the walker to enter "a".
        let (_, tree) = normalize_filters(&[exclude("a"), exclude("a/b")]).unwrap();
        let view = FilterView::root(tree);
        assert!(view.child_excluded("a"));
    }

    #[test]
    fn dot_sets_the_root() {
        let (_, tree) = normalize_filters(&[exclude("."), include("keep")]).unwrap();
        let view = FilterView::root(tree);
        assert!(!view.fully_excluded());
        assert!(view.child_excluded("dropped"));
        assert!(!view.child_excluded("keep"));

        let (_, tree) = normalize_filters(&[exclude(".")]).unwrap();
        assert!(FilterView::root(tree).fully_excluded());
    }

    #[test]
    fn patterns_are_split_out() {
        let filters = [
            Filter::new(FilterType::PatternExclude, "*.txt"),
            exclude("a"),
        ];
        let (patterns, _) = normalize_filters(&filters).unwrap();
        assert_eq!(patterns.len(), 1);
        assert!(patterns[0].matches("notes.txt"));
        assert!(!patterns[0].matches("notes.jpg"));
    }

    #[test]
    fn bad_pattern_is_rejected() {
        let filters = [Filter::new(FilterType::PatternExclude, "[")];
        assert!(matches!(
            normalize_filters(&filters),
            Err(Error::InvalidArguments(_))
        ));
    }
}
