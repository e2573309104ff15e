//! Integration tests for the document generation pipeline

mod config_integration;
mod fix_loop_convergence;
mod pipeline_ordering;
mod template_registry;
pub mod test_utils;
