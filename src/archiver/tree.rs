use std::{
    collections::BTreeMap,
    path::{Component, Path, PathBuf},
};

use path_dedot::ParseDot;

use crate::{
    backend::{SourceFile, SourceFs},
    error::TargetTreeErrorKind,
    PackratResult,
};

/// The in-memory plan of the targets to archive.
///
/// A `TargetTree` is a trie over the path components of all targets: leaves
/// carry the filesystem path whose contents are to be archived, internal
/// nodes are synthetic directories above them and carry the path to stat for
/// their metadata. Traversal is by sorted child name on every level, making
/// the snapshot output stable across runs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct TargetTree {
    /// The children of this node, by unique name.
    pub(crate) children: BTreeMap<String, TargetTree>,
    /// The filesystem path to archive. Only set for leaves.
    pub(crate) path: Option<PathBuf>,
    /// The root directory this subtree is relative to.
    pub(crate) root: Option<PathBuf>,
    /// The filesystem path to stat for the metadata of this synthetic directory.
    pub(crate) fi_path: Option<PathBuf>,
}

impl TargetTree {
    /// Builds the target tree over the given targets.
    ///
    /// # Errors
    ///
    /// * [`TargetTreeErrorKind::EmptyPathComponents`] - If a target resolves to no path components.
    /// * [`TargetTreeErrorKind::UnrollCollision`] - If two targets collide within one directory.
    ///
    /// [`TargetTreeErrorKind::EmptyPathComponents`]: crate::error::TargetTreeErrorKind::EmptyPathComponents
    /// [`TargetTreeErrorKind::UnrollCollision`]: crate::error::TargetTreeErrorKind::UnrollCollision
    pub(crate) fn new(fs: &impl SourceFs, targets: &[PathBuf]) -> PackratResult<Self> {
        let mut tree = Self::default();
        for target in targets {
            let target = clean_path(target)?;
            let comps = path_components(&target, false)?;
            if comps.is_empty() {
                return Err(TargetTreeErrorKind::EmptyPathComponents(target).into());
            }
            let root = root_directory(&target);
            tree.add(&target, &root, root.clone(), &comps)?;
        }
        tree.unroll(fs)?;
        Ok(tree)
    }

    /// Inserts one target, resolving name collisions between different roots
    /// with `-1`, `-2`, … suffixes.
    fn add(
        &mut self,
        path: &Path,
        root: &Path,
        fi_base: PathBuf,
        comps: &[String],
    ) -> PackratResult<()> {
        let name = &comps[0];

        if comps.len() == 1 {
            let key = self.resolve_name(name, root, |entry| {
                entry.path.is_none() || entry.path.as_deref() == Some(path)
            });
            let entry = self.children.entry(key).or_default();
            entry.root = Some(root.to_path_buf());
            entry.path = Some(path.to_path_buf());
            return Ok(());
        }

        let key = self.resolve_name(name, root, |_| true);
        let entry = self.children.entry(key).or_default();
        let fi_path = fi_base.join(name);
        if entry.root.is_none() {
            entry.root = Some(root.to_path_buf());
        }
        if entry.fi_path.is_none() && entry.path.is_none() {
            entry.fi_path = Some(fi_path.clone());
        }
        entry.add(path, root, fi_path, &comps[1..])
    }

    /// Finds the child name to use for `name` under `root`.
    ///
    /// An existing sibling is reused iff its root matches and `accept`
    /// agrees; otherwise suffixes `-1`, `-2`, … are tried. This resolves
    /// collisions between e.g. `./foo` and `../foo`.
    fn resolve_name(
        &self,
        name: &str,
        root: &Path,
        accept: impl Fn(&Self) -> bool,
    ) -> String {
        let mut key = name.to_string();
        let mut i = 0;
        loop {
            match self.children.get(&key) {
                None => return key,
                Some(entry) if entry.root.as_deref() == Some(root) && accept(entry) => return key,
                Some(_) => {
                    i += 1;
                    key = format!("{name}-{i}");
                }
            }
        }
    }

    /// Resolves nodes which are both a leaf and an internal node by
    /// expanding the leaf's directory listing into the children.
    ///
    /// An existing child whose path equals the listed entry wins (it is the
    /// more specific target); an existing child with a different path is a
    /// planning error the caller has to resolve.
    fn unroll(&mut self, fs: &impl SourceFs) -> PackratResult<()> {
        for child in self.children.values_mut() {
            child.unroll(fs)?;
        }

        if self.path.is_none() || self.children.is_empty() {
            return Ok(());
        }
        let path = self.path.take().expect("checked above");

        let file = fs.open_file(&path)?;
        let mut names = file.read_dir_names()?;
        names.sort();

        for name in names {
            let name = name
                .to_str()
                .ok_or_else(|| TargetTreeErrorKind::NonUnicodePath(path.join(&name)))?
                .to_string();
            let entry_path = path.join(&name);
            match self.children.get(&name) {
                // a leaf for the same path, or an internal subtree with
                // deeper targets below it: the more specific target wins
                Some(existing)
                    if existing.path.is_none()
                        || existing.path.as_deref() == Some(&*entry_path) => {}
                Some(existing) => {
                    return Err(TargetTreeErrorKind::UnrollCollision(
                        name,
                        existing.path.clone().unwrap_or_default(),
                        entry_path,
                    )
                    .into());
                }
                None => {
                    _ = self.children.insert(
                        name,
                        Self {
                            path: Some(entry_path),
                            root: self.root.clone(),
                            ..Self::default()
                        },
                    );
                }
            }
        }

        self.fi_path = Some(path);
        Ok(())
    }
}

/// Cleans a path lexically, without touching the filesystem.
pub(crate) fn clean_path(path: &Path) -> PackratResult<PathBuf> {
    Ok(path
        .parse_dot()
        .map_err(|err| TargetTreeErrorKind::CleaningTargetFailed(path.to_path_buf(), err))?
        .to_path_buf())
}

/// Splits a path into its components.
///
/// The volume prefix (on platforms which have one) is kept as a virtual
/// leading component; `.` is always dropped and `..` is only kept when
/// `include_relative` is set.
pub(crate) fn path_components(
    path: &Path,
    include_relative: bool,
) -> PackratResult<Vec<String>> {
    let mut comps = Vec::new();
    for comp in path.components() {
        match comp {
            Component::Normal(name) => comps.push(
                name.to_str()
                    .ok_or_else(|| TargetTreeErrorKind::NonUnicodePath(path.to_path_buf()))?
                    .to_string(),
            ),
            Component::ParentDir if include_relative => comps.push("..".to_string()),
            Component::Prefix(prefix) => comps.push(
                prefix
                    .as_os_str()
                    .to_str()
                    .ok_or_else(|| TargetTreeErrorKind::NonUnicodePath(path.to_path_buf()))?
                    .to_string(),
            ),
            _ => {}
        }
    }
    Ok(comps)
}

/// Determines the root directory a target is relative to.
///
/// Absolute targets are rooted at the filesystem (or volume) root; relative
/// targets are rooted at `.` or at a chain of `..` matching their leading
/// parent-dir components.
pub(crate) fn root_directory(path: &Path) -> PathBuf {
    if path.is_absolute() {
        let mut root = PathBuf::new();
        for comp in path.components() {
            match comp {
                Component::Prefix(prefix) => root.push(prefix.as_os_str()),
                Component::RootDir => {
                    root.push(std::path::MAIN_SEPARATOR_STR);
                    break;
                }
                _ => break,
            }
        }
        return root;
    }

    let parents = path
        .components()
        .take_while(|comp| matches!(comp, Component::ParentDir))
        .count();
    if parents == 0 {
        PathBuf::from(".")
    } else {
        let mut root = PathBuf::new();
        for _ in 0..parents {
            root.push("..");
        }
        root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn paths(targets: &[&str]) -> Vec<PathBuf> {
        targets.iter().map(PathBuf::from).collect()
    }

    // a SourceFs for plans which do not need unrolling
    fn local() -> crate::backend::local::LocalFs {
        crate::backend::local::LocalFs::default()
    }

    #[rstest]
    #[case("foo/bar", &["foo", "bar"])]
    #[case("./foo/bar", &["foo", "bar"])]
    #[case("../foo", &["foo"])]
    #[case("/foo/bar", &["foo", "bar"])]
    #[case(".", &[])]
    #[case("..", &[])]
    fn test_path_components_passes(#[case] path: &str, #[case] expected: &[&str]) {
        let comps = path_components(Path::new(path), false).unwrap();
        assert_eq!(comps, expected);
    }

    #[rstest]
    #[case("foo/bar", ".")]
    #[case("../foo", "..")]
    #[case("../../foo", "../..")]
    #[case("/foo/bar", "/")]
    fn test_root_directory_passes(#[case] path: &str, #[case] expected: &str) {
        assert_eq!(root_directory(Path::new(path)), PathBuf::from(expected));
    }

    #[test]
    fn test_plan_simple_targets_passes() {
        let tree = TargetTree::new(&local(), &paths(&["foo", "bar", "baz"])).unwrap();

        let names: Vec<_> = tree.children.keys().cloned().collect();
        assert_eq!(names, ["bar", "baz", "foo"]);
        for (name, child) in &tree.children {
            assert_eq!(child.path.as_deref(), Some(Path::new(name)));
            assert_eq!(child.root.as_deref(), Some(Path::new(".")));
            assert!(child.children.is_empty());
        }
    }

    #[test]
    fn test_plan_collision_suffix_passes() {
        let tree =
            TargetTree::new(&local(), &paths(&["foo/user1", "../foo/other", "foo/user2"])).unwrap();

        let names: Vec<_> = tree.children.keys().cloned().collect();
        assert_eq!(names, ["foo", "foo-1"]);

        let foo = &tree.children["foo"];
        assert_eq!(foo.root.as_deref(), Some(Path::new(".")));
        let subnames: Vec<_> = foo.children.keys().cloned().collect();
        assert_eq!(subnames, ["user1", "user2"]);

        let foo1 = &tree.children["foo-1"];
        assert_eq!(foo1.root.as_deref(), Some(Path::new("..")));
        let subnames: Vec<_> = foo1.children.keys().cloned().collect();
        assert_eq!(subnames, ["other"]);
        assert_eq!(
            foo1.children["other"].path.as_deref(),
            Some(Path::new("../foo/other"))
        );
    }

    #[test]
    fn test_plan_duplicate_target_is_deduplicated_passes() {
        let tree = TargetTree::new(&local(), &paths(&["foo", "foo"])).unwrap();

        assert_eq!(tree.children.len(), 1);
    }

    #[test]
    fn test_plan_empty_target_fails() {
        assert!(TargetTree::new(&local(), &paths(&["."])).is_err());
    }

    #[test]
    fn test_plan_unrolls_past_internal_subtargets_passes() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir(&work).unwrap();
        std::fs::write(work.join("user1"), b"1").unwrap();
        let user2 = work.join("user2");
        std::fs::create_dir(&user2).unwrap();
        std::fs::write(user2.join("inner"), b"2").unwrap();

        // `user2` becomes an internal node with the deeper target below it;
        // the listing of `work` still contains the real `user2` directory
        let targets = vec![work.clone(), user2.join("inner")];
        let tree = TargetTree::new(&local(), &targets).unwrap();

        let mut node = &tree;
        while node.fi_path.as_deref() != Some(&*work) {
            node = node.children.values().next().unwrap();
        }

        let names: Vec<_> = node.children.keys().cloned().collect();
        assert_eq!(names, ["user1", "user2"]);
        assert!(node.path.is_none());

        let user2_node = &node.children["user2"];
        assert!(user2_node.path.is_none());
        assert_eq!(user2_node.fi_path.as_deref(), Some(&*user2));
        assert_eq!(
            user2_node.children["inner"].path.as_deref(),
            Some(&*user2.join("inner"))
        );
    }

    #[test]
    fn test_plan_internal_nodes_carry_fi_path_passes() {
        let tree = TargetTree::new(&local(), &paths(&["foo/bar/baz"])).unwrap();

        let foo = &tree.children["foo"];
        assert_eq!(foo.fi_path.as_deref(), Some(Path::new("./foo")));
        let bar = &foo.children["bar"];
        assert_eq!(bar.fi_path.as_deref(), Some(Path::new("./foo/bar")));
        assert_eq!(
            bar.children["baz"].path.as_deref(),
            Some(Path::new("foo/bar/baz"))
        );
    }

    #[test]
    fn test_plan_unrolls_overlapping_targets_passes() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir(&work).unwrap();
        std::fs::write(work.join("user1"), b"1").unwrap();
        std::fs::write(work.join("user2"), b"2").unwrap();

        let targets = vec![work.clone(), work.join("user2")];
        let tree = TargetTree::new(&local(), &targets).unwrap();

        // navigate to the `work` node
        let mut node = &tree;
        while node.path.is_none() && node.children.len() == 1 {
            node = node.children.values().next().unwrap();
        }

        let names: Vec<_> = node.children.keys().cloned().collect();
        assert_eq!(names, ["user1", "user2"]);
        assert_eq!(node.fi_path.as_deref(), Some(&*work));
        assert!(node.path.is_none());
        assert_eq!(
            node.children["user1"].path.as_deref(),
            Some(&*work.join("user1"))
        );
    }
}
