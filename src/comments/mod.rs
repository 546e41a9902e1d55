//! Two-level comment trees with lazy reply expansion.
//!
//! Each top-level comment is a node that starts collapsed with only its
//! reply count. The first expansion fetches replies exactly once; replies
//! pushed while a node is collapsed bump the count and wait in a queue that
//! is merged into the list on expansion.

mod tree;

pub use tree::{CommentConfig, CommentNode, CommentTree, NodeState};
