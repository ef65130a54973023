//! Hardware-independent helpers for writing a port of `mos_kernel`.
//!
//! This crate contains the parts of a port that can be tested on a host: the
//! adaptive tick state machine that turns a down-counting reload timer (e.g.,
//! Arm SysTick) into the kernel's `PortTimer` interface.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(rust_2018_idioms)]

pub mod tickless;
