use crate::api::config_dto::InterpreterConfigDto;
use crate::api::graph_dto::GraphDto;
use crate::domain::graph::graph::WorkflowGraph;
use crate::domain::interpreter::config::InterpreterConfig;
use crate::error::Result;
use crate::loader::parser::parse_json_file;

pub mod api;
pub mod domain;
pub mod error;
pub mod loader;
pub mod logger;

/// Loads a workflow graph from a JSON file.
pub fn load_workflow(file_path: &str) -> Result<WorkflowGraph> {
    let graph_dto: GraphDto = parse_json_file::<GraphDto>(file_path)?;
    log::info!("Workflow file '{}' parsed successfully.", file_path);

    let graph = WorkflowGraph::from_dto(graph_dto)?;
    log::info!("Workflow graph '{}' constructed with {} nodes.", graph.name, graph.len());

    Ok(graph)
}

/// Loads interpreter settings from a JSON file. Missing fields keep their defaults.
pub fn load_config(file_path: &str) -> Result<InterpreterConfig> {
    let config_dto: InterpreterConfigDto = parse_json_file::<InterpreterConfigDto>(file_path)?;
    InterpreterConfig::from_dto(config_dto)
}
