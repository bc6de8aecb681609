//! Call-tree export
//!
//! Serializes a [`Forest`] to JSON in the shape consumers of block reports
//! expect:
//!
//! ```text
//! { "address": "0x55f3a2b4c785", "symbol": "app::run", "repeatCount": 7,
//!   "repeatCountBackground": 0, "children": [ ... ] }
//! ```
//!
//! `symbol` is omitted for unresolved nodes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;

use crate::analysis::{AddressFrameNode, Forest};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedNode {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub repeat_count: u32,
    pub repeat_count_background: u32,
    #[serde(default)]
    pub children: Vec<ExportedNode>,
}

impl From<&AddressFrameNode> for ExportedNode {
    fn from(node: &AddressFrameNode) -> Self {
        Self {
            address: format!("0x{:x}", node.address),
            symbol: node.resolved_symbol.clone(),
            repeat_count: node.repeat_count,
            repeat_count_background: node.repeat_count_background,
            children: node.children.iter().map(ExportedNode::from).collect(),
        }
    }
}

/// Writes one forest as a JSON array of root nodes
pub struct CallTreeExporter {
    roots: Vec<ExportedNode>,
}

impl CallTreeExporter {
    #[must_use]
    pub fn new(forest: &Forest) -> Self {
        Self { roots: forest.iter().map(ExportedNode::from).collect() }
    }

    #[must_use]
    pub fn roots(&self) -> &[ExportedNode] {
        &self.roots
    }

    /// Write pretty-printed JSON to `writer`
    ///
    /// # Errors
    /// Returns an error if serialization or the write fails
    pub fn export<W: Write>(&self, mut writer: W) -> Result<()> {
        serde_json::to_writer_pretty(&mut writer, &self.roots)
            .context("Failed to serialize call tree")?;
        writeln!(writer).context("Failed to write call tree")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(address: usize, count: u32, symbol: Option<&str>) -> AddressFrameNode {
        AddressFrameNode {
            address,
            repeat_count: count,
            repeat_count_background: 0,
            children: Vec::new(),
            program_counter: false,
            resolved_symbol: symbol.map(str::to_string),
        }
    }

    #[test]
    fn test_node_shape() {
        let mut root = node(0x1000, 7, Some("app::run"));
        root.children.push(node(0x2000, 7, None));

        let value = serde_json::to_value(ExportedNode::from(&root)).unwrap();
        assert_eq!(value["address"], "0x1000");
        assert_eq!(value["symbol"], "app::run");
        assert_eq!(value["repeatCount"], 7);
        assert_eq!(value["repeatCountBackground"], 0);

        let child = &value["children"][0];
        assert!(child.get("symbol").is_none());
        assert_eq!(child["children"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn test_export_writes_json_array() {
        let forest = vec![node(0x10, 2, Some("a")), node(0x20, 1, None)];
        let mut buffer = Vec::new();
        CallTreeExporter::new(&forest).export(&mut buffer).unwrap();

        let parsed: Vec<ExportedNode> = serde_json::from_slice(&buffer).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].address, "0x20");
        assert_eq!(parsed[1].symbol, None);
    }
}
