//! # lotse-ffi
//!
//! C boundary for the Lotse port manager.
//!
//! Every function reports failure through a thread-local last-error slot
//! queried with [`error::last_error_length`] and
//! [`error::last_error_message`]. The shipped `include/lotse.h` header
//! declares the full surface.

#![warn(missing_docs)]
#![allow(unsafe_code)]

pub mod error;
pub mod log;
pub mod port;
