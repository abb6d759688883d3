use enumset::{EnumSet, EnumSetType};
use log::warn;
use serde_derive::{Deserialize, Serialize};

use crate::{
    backend::node::Node,
    blob::tree::Tree,
    error::{PackratErrorKind, RepositoryErrorKind},
    repository::ArchiveRepository,
};

/// Attributes which are deliberately not considered when checking whether a
/// file changed relative to the parent snapshot.
///
/// Content identity is approximated by (size, mtime, ctime, inode): hashing
/// the contents is exactly the work change detection is there to avoid.
#[derive(EnumSetType, Debug, Serialize, Deserialize)]
#[enumset(serialize_repr = "list")]
pub enum ChangeIgnore {
    /// Ignore ctime changes when checking for modified files
    Ctime,
    /// Ignore inode number changes when checking for modified files
    Inode,
}

/// Decides whether a file has to be re-read relative to its parent node.
///
/// # Arguments
///
/// * `node` - The node built from the current stat.
/// * `parent` - The node of the parent snapshot.
/// * `ignore` - Which attributes not to compare.
pub(crate) fn file_changed(node: &Node, parent: &Node, ignore: EnumSet<ChangeIgnore>) -> bool {
    if !parent.is_file() {
        return true;
    }
    if node.meta.size != parent.meta.size || node.meta.mtime != parent.meta.mtime {
        return true;
    }
    if !ignore.contains(ChangeIgnore::Ctime) {
        // ctime only compares when both sides actually have one
        if let (Some(ctime), Some(p_ctime)) = (node.meta.ctime, parent.meta.ctime) {
            if ctime != p_ctime {
                return true;
            }
        }
    }
    if !ignore.contains(ChangeIgnore::Inode)
        && parent.meta.inode != 0
        && parent.meta.inode != node.meta.inode
    {
        return true;
    }
    false
}

/// Loads the subtree of the given parent node, proceeding without a parent on failure.
///
/// A parent snapshot is an optimization only: a tree which cannot be loaded
/// is logged and skipped, it never fails the snapshot.
pub(crate) fn load_parent_subtree(
    repo: &impl ArchiveRepository,
    node: &Node,
) -> Option<Tree> {
    if !node.is_dir() {
        return None;
    }
    let id = node.subtree.or_else(|| {
        warn!("ignoring parent node {}: is no tree", node.name);
        None
    })?;
    match repo.load_tree(&id) {
        Ok(tree) => Some(tree),
        Err(err) => {
            match err.into_inner() {
                PackratErrorKind::Repository(RepositoryErrorKind::TreeNotFound(_)) => {
                    warn!("parent tree {id} is not in the index, consider repairing the repository");
                }
                err => warn!("error loading parent tree {id}, ignoring it: {err}"),
            }
            None
        }
    }
}
