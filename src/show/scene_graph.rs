// Copyright 2025 The vephor Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::fmt;

use crate::AppError::IllegalStateError;
use crate::AppResult;

pub type NodeId = usize;

/// The nine screen-space nodes every window provides as parents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Anchor {
    TopLeft,
    Top,
    TopRight,
    Left,
    Center,
    Right,
    BottomLeft,
    Bottom,
    BottomRight,
}

impl Anchor {
    pub const ALL: [Anchor; 9] = [
        Anchor::TopLeft,
        Anchor::Top,
        Anchor::TopRight,
        Anchor::Left,
        Anchor::Center,
        Anchor::Right,
        Anchor::BottomLeft,
        Anchor::Bottom,
        Anchor::BottomRight,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Anchor::TopLeft => "window_top_left",
            Anchor::Top => "window_top",
            Anchor::TopRight => "window_top_right",
            Anchor::Left => "window_left",
            Anchor::Center => "window_center",
            Anchor::Right => "window_right",
            Anchor::BottomLeft => "window_bottom_left",
            Anchor::Bottom => "window_bottom",
            Anchor::BottomRight => "window_bottom_right",
        }
    }

    pub fn from_name(name: &str) -> Option<Anchor> {
        Anchor::ALL.into_iter().find(|anchor| anchor.name() == name)
    }
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SceneNode {
    pub name: String,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

/// Arena of transform nodes for one window.
///
/// Links are ids in both directions and every lookup goes through the arena, so
/// there is no ownership between nodes. Freed slots are reused.
#[derive(Debug, Default)]
pub struct SceneGraph {
    nodes: Vec<Option<SceneNode>>,
    free: Vec<NodeId>,
    by_name: HashMap<String, NodeId>,
    anchors: HashMap<Anchor, NodeId>,
}

impl SceneGraph {
    /// A graph holding only the nine anchors.
    pub fn with_anchors() -> SceneGraph {
        let mut graph = SceneGraph::default();
        for anchor in Anchor::ALL {
            let node = graph.add(anchor.name());
            graph.anchors.insert(anchor, node);
        }
        graph
    }

    pub fn anchor(&self, anchor: Anchor) -> Option<NodeId> {
        self.anchors.get(&anchor).copied()
    }

    pub fn add(&mut self, name: impl Into<String>) -> NodeId {
        let name = name.into();
        let node = SceneNode {
            name: name.clone(),
            parent: None,
            children: Vec::new(),
        };
        let id = match self.free.pop() {
            Some(id) => {
                self.nodes[id] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.by_name.insert(name, id);
        id
    }

    pub fn get(&self, id: NodeId) -> Option<&SceneNode> {
        self.nodes.get(id).and_then(Option::as_ref)
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_ancestor(&self, ancestor: NodeId, mut node: NodeId) -> bool {
        loop {
            if node == ancestor {
                return true;
            }
            match self.get(node).and_then(|n| n.parent) {
                Some(parent) => node = parent,
                None => return false,
            }
        }
    }

    fn detach(&mut self, id: NodeId) {
        let old_parent = self.get(id).and_then(|n| n.parent);
        if let Some(parent) = old_parent.and_then(|p| self.nodes[p].as_mut()) {
            parent.children.retain(|child| *child != id);
        }
        if let Some(node) = self.nodes[id].as_mut() {
            node.parent = None;
        }
    }

    /// Moves `id` under `parent`, or to the root with `None`. Links that would
    /// close a cycle are refused.
    pub fn set_parent(&mut self, id: NodeId, parent: Option<NodeId>) -> AppResult<()> {
        if self.get(id).is_none() {
            return Err(IllegalStateError(format!("no scene node {}", id)));
        }
        if let Some(parent) = parent {
            if self.get(parent).is_none() {
                return Err(IllegalStateError(format!("no parent scene node {}", parent)));
            }
            if self.is_ancestor(id, parent) {
                return Err(IllegalStateError(format!(
                    "parenting node {} under {} would form a cycle",
                    id, parent
                )));
            }
        }
        self.detach(id);
        if let Some(parent) = parent {
            if let Some(node) = self.nodes[id].as_mut() {
                node.parent = Some(parent);
            }
            if let Some(parent_node) = self.nodes[parent].as_mut() {
                parent_node.children.push(id);
            }
        }
        Ok(())
    }

    /// Frees `id`. Its children move to the root.
    pub fn remove(&mut self, id: NodeId) -> Option<SceneNode> {
        self.get(id)?;
        self.detach(id);
        let node = self.nodes[id].take()?;
        for child in &node.children {
            if let Some(child_node) = self.nodes[*child].as_mut() {
                child_node.parent = None;
            }
        }
        if self.by_name.get(&node.name) == Some(&id) {
            self.by_name.remove(&node.name);
        }
        self.free.push(id);
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anchors_present() {
        let graph = SceneGraph::with_anchors();
        assert_eq!(graph.len(), 9);
        for anchor in Anchor::ALL {
            let node = graph.anchor(anchor).unwrap();
            assert_eq!(graph.find(anchor.name()), Some(node));
            assert_eq!(Anchor::from_name(anchor.name()), Some(anchor));
        }
    }

    #[test]
    fn test_reparent_moves_child() -> AppResult<()> {
        let mut graph = SceneGraph::default();
        let a = graph.add("a");
        let b = graph.add("b");
        let c = graph.add("c");
        graph.set_parent(c, Some(a))?;
        graph.set_parent(c, Some(b))?;
        assert!(graph.get(a).unwrap().children.is_empty());
        assert_eq!(graph.get(b).unwrap().children, vec![c]);
        assert_eq!(graph.get(c).unwrap().parent, Some(b));
        Ok(())
    }

    #[test]
    fn test_cycle_rejected() -> AppResult<()> {
        let mut graph = SceneGraph::default();
        let a = graph.add("a");
        let b = graph.add("b");
        graph.set_parent(b, Some(a))?;
        assert!(graph.set_parent(a, Some(b)).is_err());
        assert!(graph.set_parent(a, Some(a)).is_err());
        Ok(())
    }

    #[test]
    fn test_remove_orphans_children_and_reuses_slot() -> AppResult<()> {
        let mut graph = SceneGraph::default();
        let parent = graph.add("p");
        let child = graph.add("c");
        graph.set_parent(child, Some(parent))?;
        assert!(graph.remove(parent).is_some());
        assert_eq!(graph.get(child).unwrap().parent, None);
        assert_eq!(graph.find("p"), None);

        let reused = graph.add("q");
        assert_eq!(reused, parent);
        assert_eq!(graph.len(), 2);
        Ok(())
    }
}
