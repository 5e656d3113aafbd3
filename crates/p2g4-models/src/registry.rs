//! Name-keyed model registry.
//!
//! Built-in models are registered under fixed names. Any other name is looked
//! up as a dynamic library in the configured library directory.

use crate::channel::NtNcable;
use crate::dll::{DynChannel, DynModem};
use crate::modem::{BleSimple, Magic};
use crate::{ChannelModel, ModelError, ModemModel};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the default channel model.
pub const DEFAULT_CHANNEL: &str = "NtNcable";

/// Name of the default modem model.
pub const DEFAULT_MODEM: &str = "Magic";

/// Arguments handed to a model constructor.
#[derive(Debug, Clone, Copy)]
pub struct ModelArgs<'a> {
    /// Model specific command-line style arguments.
    pub args: &'a [String],
    /// Device the model instance serves (modems only).
    pub dev_nbr: usize,
    /// Number of devices in the simulation.
    pub n_devs: usize,
}

impl<'a> ModelArgs<'a> {
    /// Arguments for a channel model.
    pub fn channel(args: &'a [String], n_devs: usize) -> Self {
        Self { args, dev_nbr: 0, n_devs }
    }

    /// Arguments for device `dev_nbr`'s modem.
    pub fn modem(args: &'a [String], dev_nbr: usize, n_devs: usize) -> Self {
        Self { args, dev_nbr, n_devs }
    }
}

/// Constructor of a channel model.
pub type ChannelFactory = fn(&ModelArgs<'_>) -> Result<Box<dyn ChannelModel>, ModelError>;

/// Constructor of a modem model.
pub type ModemFactory = fn(&ModelArgs<'_>) -> Result<Box<dyn ModemModel>, ModelError>;

/// Registry of available channel and modem models.
pub struct PluginRegistry {
    channels: BTreeMap<String, ChannelFactory>,
    modems: BTreeMap<String, ModemFactory>,
    lib_dir: PathBuf,
}

impl PluginRegistry {
    /// Registry without any model.
    pub fn empty(lib_dir: impl Into<PathBuf>) -> Self {
        Self {
            channels: BTreeMap::new(),
            modems: BTreeMap::new(),
            lib_dir: lib_dir.into(),
        }
    }

    /// Registry with the built-in models.
    pub fn with_builtins(lib_dir: impl Into<PathBuf>) -> Self {
        let mut registry = Self::empty(lib_dir);
        registry.register_channel(DEFAULT_CHANNEL, |a| Ok(Box::new(NtNcable::from_args(a)?)));
        registry.register_modem(DEFAULT_MODEM, |a| Ok(Box::new(Magic::from_args(a)?)));
        registry.register_modem("BLE_simple", |a| Ok(Box::new(BleSimple::from_args(a)?)));
        registry
    }

    /// Add or replace a channel model.
    pub fn register_channel(&mut self, name: &str, factory: ChannelFactory) {
        self.channels.insert(name.to_string(), factory);
    }

    /// Add or replace a modem model.
    pub fn register_modem(&mut self, name: &str, factory: ModemFactory) {
        self.modems.insert(name.to_string(), factory);
    }

    /// Names of the registered channel models.
    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    /// Names of the registered modem models.
    pub fn modem_names(&self) -> impl Iterator<Item = &str> {
        self.modems.keys().map(String::as_str)
    }

    /// Directory searched for model libraries.
    pub fn lib_dir(&self) -> &Path {
        &self.lib_dir
    }

    /// Library file expected for a channel named `name`.
    pub fn channel_library(&self, name: &str) -> PathBuf {
        self.lib_dir.join(format!("lib_2G4Channel_{}.so", name))
    }

    /// Library file expected for a modem named `name`.
    pub fn modem_library(&self, name: &str) -> PathBuf {
        self.lib_dir.join(format!("lib_2G4Modem_{}.so", name))
    }

    /// Instantiate the channel model `name`.
    pub fn create_channel(&self, name: &str, args: &ModelArgs<'_>) -> Result<Box<dyn ChannelModel>, ModelError> {
        if let Some(factory) = self.channels.get(name) {
            return factory(args);
        }
        let path = self.channel_library(name);
        if !path.exists() {
            return Err(ModelError::Unknown {
                kind: "channel",
                name: name.to_string(),
            });
        }
        debug!("Loading channel library {}", path.display());
        Ok(Box::new(DynChannel::load(&path, name, args)?))
    }

    /// Instantiate the modem model `name` for one device.
    pub fn create_modem(&self, name: &str, args: &ModelArgs<'_>) -> Result<Box<dyn ModemModel>, ModelError> {
        if let Some(factory) = self.modems.get(name) {
            return factory(args);
        }
        let path = self.modem_library(name);
        if !path.exists() {
            return Err(ModelError::Unknown {
                kind: "modem",
                name: name.to_string(),
            });
        }
        debug!("Loading modem library {} for device {}", path.display(), args.dev_nbr);
        Ok(Box::new(DynModem::load(&path, name, args)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_listed() {
        let registry = PluginRegistry::with_builtins("/nonexistent");
        assert_eq!(registry.channel_names().collect::<Vec<_>>(), vec!["NtNcable"]);
        assert_eq!(registry.modem_names().collect::<Vec<_>>(), vec!["BLE_simple", "Magic"]);
    }

    #[test]
    fn test_create_builtin() {
        let registry = PluginRegistry::with_builtins("/nonexistent");
        let args = vec!["--at=30".to_string()];
        assert!(registry.create_channel("NtNcable", &ModelArgs::channel(&args, 2)).is_ok());
        assert!(registry.create_modem("Magic", &ModelArgs::modem(&[], 1, 2)).is_ok());
    }

    #[test]
    fn test_unknown_model() {
        let registry = PluginRegistry::with_builtins("/nonexistent");
        let err = registry.create_modem("Nope", &ModelArgs::modem(&[], 0, 1)).err();
        assert!(matches!(err, Some(ModelError::Unknown { kind: "modem", .. })));
        assert_eq!(
            registry.channel_library("Indoorv1"),
            PathBuf::from("/nonexistent/lib_2G4Channel_Indoorv1.so")
        );
    }
}
