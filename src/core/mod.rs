//! Núcleo do emulador: barramento, bank switching e slots de expansão.

pub mod bankswitch;
pub mod machine;
pub mod memory;
pub mod nubus;
