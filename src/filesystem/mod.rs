//! Device filesystem mirror and the parsers that keep it current.

pub mod dispatch;
pub mod parsers;
pub mod tree;

pub use dispatch::{ReplyDispatcher, ReplyInbox};
pub use parsers::Completion;
pub use tree::{DEVICE_ROOT, FileNode, FileTree};
