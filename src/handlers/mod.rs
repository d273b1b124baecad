//! Instruction handlers and the dispatch table that routes each instruction
//! type to one of them.
//!
//! Every known [`crate::manifest::InstructionKind`] maps to exactly one
//! handler. Unknown kinds resolve to [`NotImplementedHandler`].

mod registry;

pub use registry::{
    Context, HandlerContext, HandlerFuture, HandlerOutput, HandlerTable, InstructionHandler,
    NopHandler, NotImplementedHandler, builtin_handler,
};

pub mod process;

// Handler implementations
mod git;
mod install;
mod registers;
mod toolchain;
mod verify;

pub use git::{CheckoutHandler, FetchRepoHandler};
pub use install::InstallHandler;
pub use registers::{LoadHandler, MoveHandler, StoreHandler};
pub use toolchain::{CompileHandler, ExecuteHandler, Toolchain};
pub use verify::VerifyHashHandler;
