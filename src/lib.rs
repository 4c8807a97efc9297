//! NovaMail: polling email autoresponder.

pub mod channels;
pub mod config;
pub mod context;
pub mod error;
pub mod llm;
pub mod pipeline;
