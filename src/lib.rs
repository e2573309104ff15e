//! docforge: source documents to a compiled LaTeX document
//!
//! A staged LLM pipeline (analyze, outline, chapters, assemble) followed by a
//! compile-validate-fix loop that drives the assembled document to a compiled
//! artifact. Collaborators (LLM gateway, compiler, template provider) are traits;
//! the crate ships process, HTTP and filesystem implementations of each.

pub mod cli;
pub mod compiler;
pub mod config;
pub mod error;
pub mod extract;
pub mod logging;
pub mod pipeline;
pub mod provider;
pub mod template;
