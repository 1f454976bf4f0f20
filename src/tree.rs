//! Depth-first traversal and tree-drawing prefixes for collapsible trees.

/// A node of a collapsible tree. A node is "traversable" when it is expanded: its children are
/// then visible.
pub trait TreeNode: Sized {
    fn traversable(&self) -> bool;
    fn set_prefix(&mut self, prefix: String);
    fn children(&self) -> &[Self];
    fn children_mut(&mut self) -> &mut [Self];
}

/// The tree rooted at `node` in depth-first order, `node` first.
///
/// Children of a collapsed node are skipped unless `traverse_all` is set.
pub fn depth_first_traversal<N: TreeNode>(node: &N, traverse_all: bool) -> Vec<&N> {
    let mut nodes = Vec::new();
    let mut stack = vec![node];
    while let Some(n) = stack.pop() {
        nodes.push(n);
        if traverse_all || n.traversable() {
            stack.extend(n.children().iter().rev());
        }
    }
    nodes
}

/// Calls `f` on `node` and on every descendant, collapsed or not.
pub fn for_each_mut<N: TreeNode, F: FnMut(&mut N)>(node: &mut N, f: &mut F) {
    f(node);
    for child in node.children_mut() {
        for_each_mut(child, f);
    }
}

/// Sets the prefix of every visible node of the tree rooted at `root`.
///
/// ```text
/// - build
/// ├── job
/// └─- stage
///   ├── job
///   └── job
/// ```
///
/// `+` marks a collapsed node with children, `-` an expanded one. Nodes hidden under a
/// collapsed ancestor are left untouched.
pub fn prefix_depth_first<N: TreeNode>(root: &mut N) {
    let marker = match marker(root) {
        '─' => ' ',
        m => m,
    };
    root.set_prefix(format!("{marker} "));
    if root.traversable() {
        prefix_children(root, "");
    }
}

fn prefix_children<N: TreeNode>(node: &mut N, indent: &str) {
    let count = node.children().len();
    for (i, child) in node.children_mut().iter_mut().enumerate() {
        let last = i + 1 == count;
        let branch = if last { "└─" } else { "├─" };
        child.set_prefix(format!("{indent}{branch}{} ", marker(child)));
        if child.traversable() {
            let indent = format!("{indent}{}", if last { "  " } else { "│ " });
            prefix_children(child, &indent);
        }
    }
}

fn marker<N: TreeNode>(node: &N) -> char {
    if node.children().is_empty() {
        '─'
    } else if node.traversable() {
        '-'
    } else {
        '+'
    }
}
