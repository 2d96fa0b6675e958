//! Cooperative child-process spawning and framed-pipe IPC for single-threaded
//! async runtimes.
//!
//! A single-threaded `tokio` runtime is the cooperative event loop: tasks
//! suspend at `.await` points the way a gevent/gipc greenlet suspends at a
//! blocking call, and child processes are created with a real `fork(2)`
//! (see [`process::spawn`]) rather than fork-and-exec, so the child keeps
//! running the caller's own code. Endpoints created before a `spawn` call
//! are closed automatically on one side of the fork unless explicitly
//! listed as [`process::Transferable`].

mod codec;
mod endpoint;
mod io;
mod lock;
mod process;
mod registry;

pub mod error;
pub mod pipe;

pub use codec::{CustomCodec, Decoder, DefaultCodec, Encoder, Payload, RawCodec};
pub use endpoint::{close_pair_scoped, DuplexEndpoint, GetError, ReadEndpoint, ScopedClose, WriteEndpoint};
pub use error::{Error, Result};
pub use pipe::{duplex_pipe, duplex_pipe_with, pipe, pipe_raw, pipe_with};
pub use process::{spawn, Process, Transferable};
