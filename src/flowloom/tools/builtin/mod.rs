//! Built-in tool implementations.
//!
//! These are concrete, directly invokable units (§3 "tool descriptor") that
//! get wrapped as [`super::ToolHandler`]s by [`super::adapters`] and
//! registered into a [`super::ToolRegistry`] — they don't depend on the
//! interceptor pipeline or registry themselves.
//!
//! # Available tools
//!
//! - **Calculator**: arithmetic, trigonometric, logarithmic, and statistical
//!   expression evaluation. Stateless and thread-safe.
//! - **Memory**: a persistent, TTL-aware key-value store for cross-call
//!   agent state.
//! - **Bash**: command execution on Linux and macOS with allow/deny lists,
//!   a working-directory restriction, and separate stdout/stderr capture.
//! - **File System**: sandboxed read/write/append/delete/list operations
//!   with path-traversal protection and optional extension filtering.
//!
//! # Integration
//!
//! ```ignore
//! use flowloom::flowloom::tools::adapters::MemoryHandler;
//! use flowloom::flowloom::tools::builtin::Memory;
//! use flowloom::flowloom::tools::ToolRegistry;
//! use std::sync::Arc;
//!
//! let mut registry = ToolRegistry::new();
//! registry.register(MemoryHandler::new(Arc::new(Memory::new())).into_tool());
//! ```

pub mod bash;
pub mod calculator;
pub mod filesystem;
pub mod memory;

pub use bash::{BashError, BashResult, BashTool, Platform};
pub use calculator::{Calculator, CalculatorError, CalculatorResult};
pub use filesystem::{DirectoryEntry, FileMetadata, FileSystemError, FileSystemTool};
pub use memory::{Memory, MemoryMetadata};
