//! HTTP interface.
//!
//! Turns are started and followed over Server-Sent Events; conversations
//! and provider status are plain JSON.

mod handlers;
mod server;
pub mod types;

pub use handlers::{CONVERSATION_ID_HEADER, TURN_ID_HEADER};
pub use server::{build_registry, create_router, run_server, AppState};
