// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! Backend selection.
//!
//! Everything above this module is backend-agnostic; everything below it is
//! one concrete rendition of the underlying API.  The surface is identical
//! across backends so the core can name `crate::imp::Device` and friends
//! without generics.
//!
//! The default backend is `soft`, an in-process software device.  It is not
//! a toy: it enforces heap budgets, memory-type properties, bind rules, and
//! sparse page tables, and it executes transfer commands for real against
//! host memory.  It doubles as the physical-device oracle for the test
//! suite.

#[cfg(not(feature = "backend_soft"))]
mod nop;
#[cfg(not(feature = "backend_soft"))]
pub use nop::*;

#[cfg(feature = "backend_soft")]
mod soft;
#[cfg(feature = "backend_soft")]
pub use soft::*;
