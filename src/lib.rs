pub mod app;
pub mod config;
pub mod error;
pub mod llm;
pub mod processor;
pub mod prompting;
pub mod realtime;
pub mod store;
pub mod types;
pub mod whatsapp;
