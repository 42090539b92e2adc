// Veriboard - Embedded Board Emulation Platform
// Copyright (C) 2026 The Veriboard Authors
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Plugin module loader.
//!
//! Device models outside the core ship as shared libraries named in the
//! configuration:
//!
//! ```text
//! [global]
//! libpath: /opt/veriboard/lib:/usr/local/lib/veriboard
//! libs:    libdm9000.so libm25p16.so
//! ```
//!
//! Each library exports `veriboard_module_init`, which receives the device
//! registry and registers its constructors. Directories are probed in path
//! order and the first hit wins; a library not found anywhere on the path
//! is fatal.

use anyhow::Context;
use libloading::Library;
use std::path::{Path, PathBuf};
use veriboard_config::Config;
use veriboard_core::registry::DeviceRegistry;

/// Exported initializer every plugin must provide. Plugins are built
/// against the same veriboard-core version as the host binary.
pub const MODULE_INIT_SYMBOL: &[u8] = b"veriboard_module_init";

type ModuleInit = unsafe extern "Rust" fn(&mut DeviceRegistry);

/// Keeps the loaded libraries alive. Constructors registered by plugins
/// point into the library code, so this must outlive the board.
#[derive(Debug)]
pub struct LoadedPlugins {
    libraries: Vec<(PathBuf, Library)>,
}

impl LoadedPlugins {
    pub fn count(&self) -> usize {
        self.libraries.len()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.libraries.iter().map(|(path, _)| path.as_path())
    }
}

/// Load and initialize every library listed under `[global] libs`.
pub fn load_from_config(
    config: &Config,
    registry: &mut DeviceRegistry,
) -> anyhow::Result<LoadedPlugins> {
    let libs = config.read_list("global", "libs");
    let mut loaded = LoadedPlugins {
        libraries: Vec::new(),
    };
    if libs.is_empty() {
        return Ok(loaded);
    }
    let libpath = config
        .read_var("global", "libpath")
        .unwrap_or(".")
        .to_string();
    let dirs: Vec<&str> = libpath
        .split([':', ';'])
        .filter(|d| !d.is_empty())
        .collect();
    for lib in &libs {
        let path = dirs
            .iter()
            .map(|dir| Path::new(dir).join(lib))
            .find(|candidate| candidate.exists())
            .with_context(|| format!("cannot find lib \"{lib}\" in path \"{libpath}\""))?;
        let library = load_module(&path, registry)
            .with_context(|| format!("loading module {}", path.display()))?;
        tracing::info!("loaded module {}", path.display());
        loaded.libraries.push((path, library));
    }
    Ok(loaded)
}

fn load_module(path: &Path, registry: &mut DeviceRegistry) -> anyhow::Result<Library> {
    let library = unsafe { Library::new(path) }?;
    unsafe {
        let init: libloading::Symbol<ModuleInit> = library
            .get(MODULE_INIT_SYMBOL)
            .context("module lacks the veriboard_module_init entry point")?;
        init(registry);
    }
    Ok(library)
}
