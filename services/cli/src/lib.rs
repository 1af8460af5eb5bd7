//! Terminal front end for the university chat assistant.

pub mod app;
pub mod cli;
pub mod commands;
pub mod config;
pub mod images;
pub mod ui;
