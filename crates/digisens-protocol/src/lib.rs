//! DIGIsens Weight Controller Protocol
//!
//! This crate provides types and utilities for talking to multiplexed load-cell
//! weight controllers ("devices") over a shared half-duplex RS485 bus. It is the
//! pure wire layer: nothing in here performs I/O.
//!
//! # Protocol Overview
//!
//! Every message, in both directions, is a single line of printable ASCII:
//!
//! ```text
//! <header:1><length:2><command:2><address:3|16><data:0..n><checksum:2><CR>
//! ```
//!
//! - **Header**: `@` selects the standard 3-character address space, `#` the
//!   extended 16-character one.
//! - **Length**: two decimal digits counting every character before the
//!   checksum (header and length field included).
//! - **Checksum**: XOR over every byte from the header through the data,
//!   rendered as two uppercase hex digits.
//! - **Terminator**: a single carriage return.
//!
//! Replies share the envelope; the body between the length field and the
//! checksum is laid out per command (see [`Verb::spec`]).
//!
//! # Example
//!
//! ```rust
//! use digisens_protocol::{Command, DeviceAddress, FrameCodec};
//!
//! let address = DeviceAddress::standard("123").unwrap();
//! let frame = Command::ZeroChannel { channel: 0 }.encode(&address).unwrap();
//! assert_eq!(frame, b"@09sz123040\r");
//!
//! let reply = FrameCodec::decode(b"@13 0002.130 5C\r").unwrap();
//! assert_eq!(reply.body(), " 0002.130 ");
//! ```

mod address;
mod checksum;
mod commands;
mod constants;
mod error;
mod frame;
mod responses;

pub use address::*;
pub use checksum::*;
pub use commands::*;
pub use constants::*;
pub use error::*;
pub use frame::*;
pub use responses::*;
