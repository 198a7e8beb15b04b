pub mod condition;
pub mod config;
pub mod engine;
pub mod error;
pub mod flow;
pub mod flow_commands;
pub mod invoker;
pub mod logger;
pub mod message;
pub mod node;
pub mod schema;
pub mod template;
pub mod util;
