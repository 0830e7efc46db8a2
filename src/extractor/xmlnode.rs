use std::collections::HashMap;

use serde_json::{Map, Value};

/// A loosely-typed tree preserving the shape of one ICSR subtree for audit
/// mode. Single-child elements are flattened to scalar leaves; repeated
/// sibling tags are grouped into an array on conversion to JSON, in the
/// order they appeared.
#[derive(Debug, Clone, PartialEq)]
pub enum XmlNode {
    Scalar(String),
    Element(Vec<(String, XmlNode)>),
}

impl XmlNode {
    pub fn into_json(self) -> Value {
        match self {
            XmlNode::Scalar(text) => Value::String(text),
            XmlNode::Element(children) => {
                if children.is_empty() {
                    return Value::String(String::new());
                }

                let mut counts: HashMap<String, usize> = HashMap::new();
                for (name, _) in &children {
                    *counts.entry(name.clone()).or_insert(0) += 1;
                }

                let mut map = Map::new();
                let mut grouped: HashMap<String, Vec<Value>> = HashMap::new();
                let mut order: Vec<String> = Vec::new();

                for (name, node) in children {
                    let value = node.into_json();
                    if counts[&name] > 1 {
                        if !grouped.contains_key(&name) {
                            order.push(name.clone());
                        }
                        grouped.entry(name).or_default().push(value);
                    }
                    else {
                        map.insert(name, value);
                    }
                }

                for name in order {
                    if let Some(values) = grouped.remove(&name) {
                        map.insert(name, Value::Array(values));
                    }
                }

                Value::Object(map)
            }
        }
    }
}

/// One in-progress element while building an [`XmlNode`] tree from parser
/// events. Kept on an explicit stack (see [`crate::extractor::Extractor`])
/// rather than built with recursive descent, so the depth of the call stack
/// never exceeds the nesting depth of a single ICSR.
#[derive(Debug, Default)]
pub struct NodeFrame {
    pub name: String,
    pub children: Vec<(String, XmlNode)>,
    pub text: String,
}

impl NodeFrame {
    pub fn new(name: String) -> Self {
        NodeFrame {
            name,
            children: Vec::new(),
            text: String::new(),
        }
    }

    pub fn finish(self) -> XmlNode {
        if self.children.is_empty() {
            XmlNode::Scalar(self.text.trim().to_string())
        }
        else {
            XmlNode::Element(self.children)
        }
    }
}
