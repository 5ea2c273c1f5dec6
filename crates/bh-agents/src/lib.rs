pub mod bus;
pub mod stages;
pub mod workflow;
