pub mod config_dto;
pub mod graph_dto;
