pub mod branch;
pub mod collaborators;
pub mod config;
pub mod lockfile;
pub mod proposal;
pub mod store;
pub mod types;
