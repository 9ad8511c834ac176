//! `rgl` conventions:
//! - Every object is named by a [`Handle`](handle::Handle) that remembers
//!   its kind, its owning context, and its generation. Using a null, foreign,
//!   or deleted handle is an error, never a silent no-op.
//! - Operations are methods on [`Context`](context::Context) or take one.
//!   The context validates first and only then issues the
//!   [`Driver`](driver::Driver) call.
//! - `raw()` accessors return the driver's object name.
//! - `*_allocate` leaves the new object bound to its natural target.

#![forbid(unsafe_code)]

pub mod array;
pub mod binding;
pub mod buffer;
pub mod context;
mod cursor;
pub mod draw;
pub mod driver;
pub mod fake;
pub mod framebuffer;
pub mod handle;
pub mod index;
pub mod program;
pub mod source;
pub mod texture;

pub use cursor::CursorError;
