pub mod chunk;
pub mod commands;
pub mod discord;
