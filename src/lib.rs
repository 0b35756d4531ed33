#[macro_use] extern crate log;

pub mod config;
pub mod database;
pub mod punishment;
pub mod util;
