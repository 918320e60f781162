//! Display tree built from a decoded [`Message`].
//!
//! Every node carries a one-line label and a [`Detail`] that resolves the
//! text shown when the node is selected. Trees borrow from the message they
//! were built from and are rebuilt per event.

use std::borrow::Cow;

use crate::message::{selector_segments, Message, MessageError};
use crate::util::{first_line, hexdump};

/// What a node shows when selected.
#[derive(Debug, Clone, PartialEq)]
pub enum Detail<'a> {
    /// The full sub-message behind the node.
    Message(&'a Message),
    /// Selector segments and NSXPC arguments.
    Text(&'a str),
    /// Hexdump of the raw bytes behind a `data` node.
    Hex(String),
}

impl Detail<'_> {
    pub fn text(&self) -> Cow<'_, str> {
        match self {
            Detail::Message(Message::Scalar {
                value: Some(value), ..
            }) => Cow::Borrowed(value.as_str()),
            Detail::Message(msg) => Cow::Borrowed(msg.description()),
            Detail::Text(text) => Cow::Borrowed(text),
            Detail::Hex(dump) => Cow::Borrowed(dump.as_str()),
        }
    }
}

/// One row of the display tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Node<'a> {
    /// Single-line text shown for the row.
    pub label: Cow<'a, str>,
    /// What selecting the row reveals.
    pub detail: Detail<'a>,
    /// Nested rows, in message order.
    pub children: Vec<Node<'a>>,
}

impl<'a> Node<'a> {
    fn leaf(label: impl Into<Cow<'a, str>>, detail: Detail<'a>) -> Self {
        Self {
            label: label.into(),
            detail,
            children: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Top-level nodes of one message. A container message yields a single root;
/// an NSXPC call yields one root per selector segment.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageTree<'a> {
    pub nodes: Vec<Node<'a>>,
}

impl<'a> MessageTree<'a> {
    /// Builds the tree for `message`; `data` is the event's raw-bytes
    /// companion referenced by `data` nodes.
    pub fn build(message: &'a Message, data: &[u8]) -> Result<Self, MessageError> {
        let mut nodes = Vec::new();
        visit(message, data, &mut nodes)?;
        Ok(Self { nodes })
    }

    /// One line per node, indented two spaces per level.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            render_node(node, 0, &mut out);
        }
        out
    }
}

fn render_node(node: &Node<'_>, depth: usize, out: &mut String) {
    for _ in 0..depth {
        out.push_str("  ");
    }
    out.push_str(&node.label);
    out.push('\n');
    for child in &node.children {
        render_node(child, depth + 1, out);
    }
}

fn data_bytes<'d>(data: &'d [u8], offset: Option<usize>, length: Option<usize>) -> &'d [u8] {
    match (offset, length) {
        (Some(offset), Some(length)) => offset
            .checked_add(length)
            .and_then(|end| data.get(offset..end))
            .unwrap_or(data),
        _ => data,
    }
}

fn visit<'a>(
    msg: &'a Message,
    data: &[u8],
    parent: &mut Vec<Node<'a>>,
) -> Result<(), MessageError> {
    match msg {
        Message::Nsxpc { sel, args, .. } => {
            if args.is_empty() {
                selector_segments(sel, 0)?;
                parent.push(Node::leaf(sel.as_str(), Detail::Text(sel)));
                return Ok(());
            }

            for (segment, arg) in selector_segments(sel, args.len())?.into_iter().zip(args) {
                let mut node = Node::leaf(segment, Detail::Text(segment));
                node.children.push(Node::leaf(arg.as_str(), Detail::Text(arg)));
                parent.push(node);
            }
        }

        Message::Scalar { description, .. } => {
            parent.push(Node::leaf(first_line(description), Detail::Message(msg)));
        }

        Message::Data {
            description,
            offset,
            length,
        } => {
            let dump = hexdump(data_bytes(data, *offset, *length));
            parent.push(Node::leaf(first_line(description), Detail::Hex(dump)));
        }

        Message::Array {
            description,
            values,
        } => {
            let mut node = Node::leaf(first_line(description), Detail::Message(msg));
            for value in values {
                visit(value, data, &mut node.children)?;
            }
            parent.push(node);
        }

        Message::Dictionary {
            description,
            keys,
            values,
        } => {
            if keys.len() != values.len() {
                return Err(MessageError::KeyValueMismatch {
                    keys: keys.len(),
                    values: values.len(),
                });
            }

            let mut node = Node::leaf(first_line(description), Detail::Message(msg));
            for (key, value) in keys.iter().zip(values) {
                let mut entry = Node::leaf(format!("\"{key}\" =>"), Detail::Message(value));
                visit(value, data, &mut entry.children)?;
                node.children.push(entry);
            }
            parent.push(node);
        }
    }

    Ok(())
}
