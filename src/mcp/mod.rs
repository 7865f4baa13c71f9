//! Model Context Protocol surface: chat and review tools over stdio.
pub mod server;
pub mod tools;
