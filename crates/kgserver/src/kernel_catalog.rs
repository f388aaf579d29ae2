//
// kernel_catalog.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Discovery of installed Jupyter kernelspecs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kgshared::kernel_spec::{KernelSpec, KernelSpecEntry};

/// Lists the kernel types that can be launched.
#[async_trait]
pub trait KernelCatalog: Send + Sync {
    /// All installed kernel types, keyed by name.
    async fn find_all(&self) -> HashMap<String, KernelSpecEntry>;

    /// Look up a single kernel type.
    async fn find(&self, name: &str) -> Option<KernelSpecEntry> {
        self.find_all().await.remove(name)
    }
}

/// Reads kernelspecs from the standard Jupyter data directories.
#[derive(Debug, Clone)]
pub struct KernelSpecCatalog {
    search_paths: Vec<PathBuf>,
}

impl KernelSpecCatalog {
    /// Create a catalog that searches `extra_paths` first, followed by the
    /// standard Jupyter kernelspec locations.
    pub fn new(extra_paths: Vec<PathBuf>) -> Self {
        let mut search_paths = extra_paths;
        search_paths.extend(standard_kernel_dirs());
        Self { search_paths }
    }

    /// Create a catalog that searches only the given directories.
    pub fn with_paths(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    fn scan(&self) -> HashMap<String, KernelSpecEntry> {
        let mut kernels = HashMap::new();
        for dir in &self.search_paths {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    log::trace!("Skipping kernelspec directory {}: {}", dir.display(), e);
                    continue;
                }
            };
            for entry in entries.flatten() {
                let resource_dir = entry.path();
                if !resource_dir.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();

                // Earlier directories take precedence
                if kernels.contains_key(&name) {
                    continue;
                }

                match read_kernel_spec(&resource_dir) {
                    Ok(Some(spec)) => {
                        kernels.insert(
                            name.clone(),
                            KernelSpecEntry {
                                name,
                                resource_dir: resource_dir.to_string_lossy().to_string(),
                                spec,
                            },
                        );
                    }
                    Ok(None) => {}
                    Err(e) => {
                        log::warn!(
                            "Ignoring kernelspec in {}: {}",
                            resource_dir.display(),
                            e
                        );
                    }
                }
            }
        }
        kernels
    }
}

#[async_trait]
impl KernelCatalog for KernelSpecCatalog {
    async fn find_all(&self) -> HashMap<String, KernelSpecEntry> {
        let catalog = self.clone();
        match tokio::task::spawn_blocking(move || catalog.scan()).await {
            Ok(kernels) => kernels,
            Err(e) => {
                log::error!("Failed to scan kernelspec directories: {}", e);
                HashMap::new()
            }
        }
    }
}

/// Read `kernel.json` from a resource directory; `Ok(None)` if there isn't one.
fn read_kernel_spec(resource_dir: &Path) -> Result<Option<KernelSpec>, anyhow::Error> {
    let spec_path = resource_dir.join("kernel.json");
    if !spec_path.is_file() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&spec_path)?;
    let spec: KernelSpec = serde_json::from_str(&contents)?;
    if spec.argv.is_empty() {
        anyhow::bail!("kernel.json has an empty argv");
    }
    Ok(Some(spec))
}

/// The kernelspec directories Jupyter searches, in priority order.
fn standard_kernel_dirs() -> Vec<PathBuf> {
    let mut dirs = vec![];

    if let Ok(jupyter_path) = std::env::var("JUPYTER_PATH") {
        for path in std::env::split_paths(&jupyter_path) {
            dirs.push(path.join("kernels"));
        }
    }

    if let Some(base_dirs) = directories::BaseDirs::new() {
        #[cfg(target_os = "macos")]
        dirs.push(base_dirs.home_dir().join("Library/Jupyter/kernels"));

        dirs.push(base_dirs.data_dir().join("jupyter").join("kernels"));
    }

    #[cfg(not(windows))]
    {
        dirs.push(PathBuf::from("/usr/local/share/jupyter/kernels"));
        dirs.push(PathBuf::from("/usr/share/jupyter/kernels"));
    }

    #[cfg(windows)]
    if let Ok(program_data) = std::env::var("PROGRAMDATA") {
        dirs.push(PathBuf::from(program_data).join("jupyter").join("kernels"));
    }

    dirs
}
