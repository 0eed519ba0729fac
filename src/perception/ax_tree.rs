//! Accessibility-tree simplification.
//!
//! A node is kept when its role is interactive or it carries a meaningful
//! name; everything else is structural noise for the model.
use crate::perception::types::{RawAxNode, SemanticNode};

pub const INTERACTIVE_ROLES: &[&str] = &[
    "button",
    "link",
    "textbox",
    "searchbox",
    "checkbox",
    "radio",
    "combobox",
    "listbox",
    "option",
    "menuitem",
    "menuitemcheckbox",
    "menuitemradio",
    "tab",
    "switch",
    "slider",
    "spinbutton",
    "treeitem",
];

/// Roles that only duplicate their parent's text.
const REDUNDANT_ROLES: &[&str] = &["InlineTextBox", "LineBreak", "none", "presentation"];

const MAX_NAME_CHARS: usize = 80;

pub fn simplify(raw: Vec<RawAxNode>) -> Vec<SemanticNode> {
    raw.into_iter()
        .filter(|n| !n.ignored)
        .filter_map(|n| {
            let role = n.role.unwrap_or_default();
            if role.is_empty() || REDUNDANT_ROLES.contains(&role.as_str()) {
                return None;
            }
            let name = normalize_name(n.name.as_deref().unwrap_or(""));
            let interactive = INTERACTIVE_ROLES.contains(&role.as_str());
            if !interactive && name.chars().count() <= 1 {
                return None;
            }
            Some(SemanticNode {
                node_id: n.node_id,
                role,
                name,
                enabled: !n.disabled,
                visible: !n.hidden,
                backend_node_id: n.backend_node_id,
            })
        })
        .collect()
}

/// Selects at most `max` nodes for the prompt, interactive ones first,
/// preserving document order within the selection.
pub fn prune_for_prompt(nodes: &[SemanticNode], max: usize) -> Vec<&SemanticNode> {
    let mut picked: Vec<(usize, &SemanticNode)> = nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.is_interactive() && n.visible)
        .take(max)
        .collect();

    if picked.len() < max {
        let room = max - picked.len();
        picked.extend(
            nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| !(n.is_interactive() && n.visible) && !n.name.is_empty())
                .take(room),
        );
    }

    picked.sort_by_key(|(idx, _)| *idx);
    picked.into_iter().map(|(_, n)| n).collect()
}

fn normalize_name(name: &str) -> String {
    let collapsed = name.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > MAX_NAME_CHARS {
        let cut: String = collapsed.chars().take(MAX_NAME_CHARS).collect();
        format!("{cut}…")
    } else {
        collapsed
    }
}
