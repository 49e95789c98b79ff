pub mod actor;
pub mod app_state;
pub mod collaborators;
pub mod errors;
pub mod startup;
