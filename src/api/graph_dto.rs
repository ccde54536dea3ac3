use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GraphDto {
    pub name: String,

    pub nodes: Vec<NodeDto>,

    #[serde(default)]
    pub edges: Vec<EdgeDto>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NodeDto {
    pub id: String,

    /// Binding name of Input/Output nodes, defaults to the id.
    #[serde(default)]
    pub name: Option<String>,

    /// e.g. "service", "if", "endIf", "forEach", "subWorkflow", "resourceStart"
    pub kind: String,

    #[serde(default)]
    pub data_in: Vec<PortDto>,

    #[serde(default)]
    pub data_out: Vec<PortDto>,

    #[serde(default)]
    pub control_in: bool,

    /// Names of the control-out ports. If nodes get "true" and "false" when omitted.
    #[serde(default)]
    pub control_out: Vec<String>,

    #[serde(default)]
    pub service: Option<String>,

    #[serde(default)]
    pub expression: Option<String>,

    /// Literal of Constant nodes, default of Input nodes, text of Memo nodes.
    #[serde(default)]
    pub value: Option<Value>,

    #[serde(default)]
    pub sub_workflow: Option<Box<GraphDto>>,

    #[serde(default, rename = "break")]
    pub break_point: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PortDto {
    pub name: String,

    #[serde(default)]
    pub value_type: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDto {
    pub from: EndpointDto,
    pub to: EndpointDto,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDto {
    pub node: String,
    pub port: String,
}
