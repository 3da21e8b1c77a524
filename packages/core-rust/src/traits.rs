use crate::types::{Arguments, Value};

/// A capability module: one independently loadable unit owning one or more
/// operations of a single interface.
///
/// Modules only execute operations. Loading, unloading, caching and hotness
/// are entirely the gateway's responsibility, and a module must not attempt
/// any of them itself. Instances are created by a factory registered with the
/// gateway and dropped when the gateway unloads the module.
pub trait CapabilityModule: Send + Sync {
    /// Unique module name (e.g. `"notify"`). Must match the catalog entry the
    /// module was registered under.
    fn name(&self) -> &'static str;

    /// Executes `operation` with structured `args`.
    ///
    /// # Errors
    ///
    /// Any error is returned to the gateway caller unchanged.
    fn call(&self, operation: &str, args: &Arguments) -> anyhow::Result<Value>;

    /// Called right before the instance is dropped by an unload.
    ///
    /// Returning an error aborts the unload and the module stays resident.
    ///
    /// # Errors
    ///
    /// Implementation-defined; the gateway logs and swallows it.
    fn on_unload(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
