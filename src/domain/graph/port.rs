use serde::{Deserialize, Serialize};

use crate::domain::graph::graph::{EdgeKey, NodeKey, PortKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortDirection {
    DataIn,
    DataOut,
    ControlIn,
    ControlOut,
}

impl PortDirection {
    pub fn is_input(self) -> bool {
        matches!(self, PortDirection::DataIn | PortDirection::ControlIn)
    }

    pub fn is_control(self) -> bool {
        matches!(self, PortDirection::ControlIn | PortDirection::ControlOut)
    }

    /// The direction an edge leaving a port of this direction must arrive at.
    pub fn counterpart(self) -> PortDirection {
        match self {
            PortDirection::DataIn => PortDirection::DataOut,
            PortDirection::DataOut => PortDirection::DataIn,
            PortDirection::ControlIn => PortDirection::ControlOut,
            PortDirection::ControlOut => PortDirection::ControlIn,
        }
    }
}

/// Type tag of the values flowing through a data port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ValueType {
    #[default]
    Any,
    String,
    Integer,
    Float,
    Boolean,
    List,
}

impl ValueType {
    pub fn parse(tag: &str) -> Option<ValueType> {
        match tag.to_ascii_lowercase().as_str() {
            "" | "any" => Some(ValueType::Any),
            "string" => Some(ValueType::String),
            "int" | "integer" => Some(ValueType::Integer),
            "float" | "double" => Some(ValueType::Float),
            "bool" | "boolean" => Some(ValueType::Boolean),
            "list" | "array" => Some(ValueType::List),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Port {
    pub name: String,
    pub direction: PortDirection,
    pub node: NodeKey,
    pub value_type: ValueType,
    pub edges: Vec<EdgeKey>,
}

/// Directed connection between an output port and an input port.
#[derive(Debug, Clone)]
pub struct Edge {
    pub from: PortKey,
    pub to: PortKey,

    /// Only used on control edges leaving an If node; `None` until the If is evaluated.
    pub condition_met: Option<bool>,
}
