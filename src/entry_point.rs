// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use crate::imp;
///Platform-independent entrypoint implementation
///
use std::fmt::{Debug, Formatter};
use std::sync::OnceLock;

#[derive(Debug)]
pub struct EntryPoint(pub(crate) crate::imp::EntryPoint);
///platform-independent error type
#[derive(Debug)]
pub struct EntryPointError(imp::Error);
impl std::fmt::Display for EntryPointError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}
impl std::error::Error for EntryPointError {}

impl EntryPoint {
    ///Must use this constructor to get a [crate::resources::Device]-compatible entrypoint.
    pub fn new() -> Result<Self, EntryPointError> {
        crate::imp::EntryPoint::new()
            .map(EntryPoint)
            .map_err(EntryPointError)
    }

    /// A process-wide entry point, created on first use.  Most programs want
    /// exactly one; creating additional entry points is legal but each gets
    /// its own backend instance.
    pub fn shared() -> Result<&'static EntryPoint, EntryPointError> {
        static SHARED: OnceLock<EntryPoint> = OnceLock::new();
        // racing initializers both construct; one wins, the loser's backend
        // instance is dropped
        if let Some(existing) = SHARED.get() {
            return Ok(existing);
        }
        let fresh = EntryPoint::new()?;
        Ok(SHARED.get_or_init(|| fresh))
    }

    pub(crate) fn imp(&self) -> &imp::EntryPoint {
        &self.0
    }
}
