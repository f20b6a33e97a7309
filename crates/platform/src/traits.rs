//! Core traits for espx modules

use crate::EspxResult;

/// Security module interface
///
/// All espx modules implement this trait to provide unified management.
/// Module-level `init` runs once when the module is registered, before any
/// per-association state is created.
pub trait SecurityModule: Send + Sync {
    /// Unique module identifier
    fn id(&self) -> &'static str;

    /// Module version
    fn version(&self) -> &'static str;

    /// Module description
    fn description(&self) -> &'static str;

    /// Initialize the module
    ///
    /// # Errors
    ///
    /// Returns an error if initialization fails
    fn init(&mut self) -> EspxResult<()> {
        Ok(())
    }

    /// Shutdown the module
    ///
    /// # Errors
    ///
    /// Returns an error if shutdown fails
    fn shutdown(&mut self) -> EspxResult<()> {
        Ok(())
    }
}
