//! Path grammar: turns a `/`- or `\`-separated path string into an
//! ordered list of name components, eliding empty segments and
//! leading/trailing whitespace. The facade resolves each component
//! against the Directory Index in turn; `examples/chiro2001-rfs` has no
//! equivalent path-walking logic to generalize, since it exposes files
//! to FUSE as (parent inode, name) pairs and lets the kernel do the
//! walking itself.

/// Split `path` into path components. `""`, `"/"`, and `"\\"` (and any
/// string made up solely of separators/whitespace) denote the root and
/// yield an empty component list.
pub fn split(path: &str) -> Vec<String> {
    path.split(['/', '\\'])
        .map(|segment| segment.trim())
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.to_string())
        .collect()
}

/// Split `path` into `(parent_components, name)`. Returns `None` if
/// `path` resolves to the root itself (it has no name of its own).
pub fn split_parent(path: &str) -> Option<(Vec<String>, String)> {
    let mut components = split(path);
    let name = components.pop()?;
    Some((components, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_variants_yield_empty() {
        assert!(split("").is_empty());
        assert!(split("/").is_empty());
        assert!(split("\\").is_empty());
        assert!(split("   /  ").is_empty());
    }

    #[test]
    fn splits_on_either_separator() {
        assert_eq!(split("a/b\\c"), vec!["a", "b", "c"]);
    }

    #[test]
    fn elides_empty_segments_and_whitespace() {
        assert_eq!(split("/a//b/ c /"), vec!["a", "b", "c"]);
    }

    #[test]
    fn split_parent_separates_last_component() {
        let (parent, name) = split_parent("/a/b/c.txt").unwrap();
        assert_eq!(parent, vec!["a", "b"]);
        assert_eq!(name, "c.txt");
    }

    #[test]
    fn split_parent_of_root_is_none() {
        assert!(split_parent("/").is_none());
    }
}
