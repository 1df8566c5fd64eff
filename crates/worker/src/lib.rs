pub mod consumer;
pub mod supervisor;
