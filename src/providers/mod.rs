pub mod memory;
pub mod openai;
pub mod personas;
pub mod sqlite;
