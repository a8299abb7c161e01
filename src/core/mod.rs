//! Pure logic: task list model, markdown parsing and rendering, gate
//! extraction, and agent reply parsing. Nothing here touches the filesystem
//! or spawns processes.

pub mod gates;
pub mod parse;
pub mod render;
pub mod reply;
pub mod tasklist;
