//! Shared types for the kernel gateway server and its clients.

/// Jupyter message types
pub mod jupyter_message;

/// Kernel message types
pub mod kernel_message;

/// Kernelspec documents
pub mod kernel_spec;

/// HTTP response bodies
pub mod models;

/// WebSocket message types
pub mod websocket_message;
