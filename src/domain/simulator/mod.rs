pub mod task_simulator;
