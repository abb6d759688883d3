use serde::{Deserialize, Deserializer};
use serde_derive::Serialize;

use crate::{
    backend::node::Node,
    crypto::hasher::hash,
    error::TreeErrorKind,
    id::Id,
    PackratResult,
};

#[derive(Default, Serialize, Deserialize, Clone, Debug)]
/// A [`Tree`] is a list of [`Node`]s
pub struct Tree {
    #[serde(deserialize_with = "deserialize_null_default")]
    /// The nodes contained in the tree, sorted in ascending byte order of `Node.name`
    pub nodes: Vec<Node>,
}

/// Deserializes `Option<T>` as `T::default()` if the value is `null`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    T: Default + Deserialize<'de>,
    D: Deserializer<'de>,
{
    let opt = Option::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

impl Tree {
    /// Creates a new `Tree` with no nodes.
    #[must_use]
    pub const fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Finds the node with the given (escaped) name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Node> {
        self.nodes
            .binary_search_by(|node| node.name.as_str().cmp(name))
            .ok()
            .map(|idx| &self.nodes[idx])
    }

    /// Inserts a node, keeping the nodes sorted by name.
    ///
    /// # Errors
    ///
    /// * [`TreeErrorKind::NotOrdered`] - If a node with the same name is already present.
    ///
    /// [`TreeErrorKind::NotOrdered`]: crate::error::TreeErrorKind::NotOrdered
    pub fn insert(&mut self, node: Node) -> PackratResult<()> {
        match self
            .nodes
            .binary_search_by(|n| n.name.as_str().cmp(&node.name))
        {
            Ok(_) => Err(TreeErrorKind::NotOrdered(node.name).into()),
            Err(idx) => {
                self.nodes.insert(idx, node);
                Ok(())
            }
        }
    }

    /// Serializes the tree in canonical JSON format.
    ///
    /// # Returns
    ///
    /// A tuple of the serialized tree as `Vec<u8>` and the tree's Id, i.e. the hash of the
    /// serialized tree.
    ///
    /// # Errors
    ///
    /// * If the tree could not be serialized. This should never happen.
    pub fn serialize(&self) -> PackratResult<(Vec<u8>, Id)> {
        let mut chunk = serde_json::to_vec(&self).map_err(TreeErrorKind::SerializingTreeFailed)?;
        // # COMPATIBILITY
        //
        // We add a newline to be compatible with `restic` here
        chunk.push(b'\n');

        let id = hash(&chunk);

        Ok((chunk, id))
    }

    /// Deserializes a tree from its serialized form.
    ///
    /// # Errors
    ///
    /// * [`TreeErrorKind::DeserializingTreeFailed`] - If deserialization fails.
    ///
    /// [`TreeErrorKind::DeserializingTreeFailed`]: crate::error::TreeErrorKind::DeserializingTreeFailed
    pub fn from_slice(data: &[u8]) -> PackratResult<Self> {
        let tree = serde_json::from_slice(data).map_err(TreeErrorKind::DeserializingTreeFailed)?;
        Ok(tree)
    }

    /// The Id of the tree without any nodes.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub(crate) fn empty_id() -> Id {
        Self::new()
            .serialize()
            .expect("serializing the empty tree should never fail")
            .1
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;

    use super::*;
    use crate::backend::node::{Metadata, NodeType};

    fn node(name: &str) -> Node {
        Node::new_node(OsStr::new(name), NodeType::File, Metadata::default())
    }

    #[test]
    fn test_insert_keeps_nodes_sorted_passes() {
        let mut tree = Tree::new();
        for name in ["c", "a", "b"] {
            tree.insert(node(name)).unwrap();
        }

        let names: Vec<_> = tree.nodes.iter().map(|node| node.name.clone()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn test_insert_duplicate_name_fails() {
        let mut tree = Tree::new();
        tree.insert(node("a")).unwrap();

        assert!(tree.insert(node("a")).is_err());
    }

    #[test]
    fn test_serialize_empty_tree_passes() {
        let (chunk, id) = Tree::new().serialize().unwrap();

        assert_eq!(chunk, b"{\"nodes\":[]}\n");
        assert_eq!(id, Tree::empty_id());
    }

    #[test]
    fn test_serialize_roundtrip_passes() {
        let mut tree = Tree::new();
        tree.insert(node("test.txt")).unwrap();

        let (chunk, id) = tree.serialize().unwrap();
        let tree2 = Tree::from_slice(&chunk).unwrap();

        assert_eq!(tree2.nodes.len(), 1);
        assert_eq!(tree2.nodes[0].name, "test.txt");
        assert_eq!(tree2.serialize().unwrap().1, id);
    }

    #[test]
    fn test_find_passes() {
        let mut tree = Tree::new();
        for name in ["bar", "baz", "foo"] {
            tree.insert(node(name)).unwrap();
        }

        assert_eq!(tree.find("baz").map(|n| n.name.as_str()), Some("baz"));
        assert!(tree.find("qux").is_none());
    }
}
