//! TOML build profiles.
//!
//! A profile file captures the whole orchestration setup declaratively: the
//! emulator launch configuration, the build targets, and any vendored
//! dependencies. Consumers load it once and register everything into a
//! [`Blueprint`](crate::Blueprint).
//!
//! ```toml
//! [qemu]
//! machine = "q35"
//! devices = ["isa-debug-exit,iobase=0xf4,iosize=0x4"]
//!
//! [[target]]
//! name   = "sandbox"
//! binary = "build/sandbox.elf"
//!
//! [dependency.googletest]
//! url        = "https://github.com/google/googletest"
//! source-dir = "build/googletest/src"
//! build-dir  = "build/googletest/obj"
//! includes   = ["googletest/include"]
//! linkables  = ["lib/libgtest.a"]
//! ```

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::bootstrap::ExternalDependency;
use crate::error::ConfigError;
use crate::image::Target;
use crate::qemu::QemuSystem;

/// A declarative description of one orchestration setup.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Profile {
    pub qemu: QemuSystem,
    pub target: Vec<Target>,
    pub dependency: BTreeMap<String, DependencySpec>,
}

/// The file-level shape of an [`ExternalDependency`]; the name comes from the
/// table key.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct DependencySpec {
    pub url: String,
    pub source_dir: Utf8PathBuf,
    pub build_dir: Utf8PathBuf,
    #[serde(default)]
    pub toolchain_file: Option<Utf8PathBuf>,
    #[serde(default)]
    pub includes: Vec<Utf8PathBuf>,
    #[serde(default)]
    pub linkables: Vec<Utf8PathBuf>,
}

impl Profile {
    pub fn from_file(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ProfileRead(path.to_owned(), e))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// The declared dependencies, ready to register.
    pub fn dependencies(&self) -> Vec<ExternalDependency> {
        self.dependency
            .iter()
            .map(|(name, spec)| ExternalDependency {
                name: name.clone(),
                url: spec.url.clone(),
                source_dir: spec.source_dir.clone(),
                build_dir: spec.build_dir.clone(),
                toolchain_file: spec.toolchain_file.clone(),
                includes: spec.includes.clone(),
                linkables: spec.linkables.clone(),
            })
            .collect()
    }
}
