pub mod file;
pub mod string;
pub mod time;
pub mod webhook;
