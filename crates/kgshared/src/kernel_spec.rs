//
// kernel_spec.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// From the Jupyter documentation for [Kernel Specs](https://jupyter-client.readthedocs.io/en/stable/kernels.html#kernel-specs).
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KernelSpec {
    /// List of command line arguments to be used to start the kernel
    pub argv: Vec<String>,

    /// The kernel name as it should be displayed in the UI
    pub display_name: String,

    /// The kernel's language
    pub language: String,

    /// Environment variables to set for the kernel
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// How the kernel expects to be interrupted ("signal" or "message")
    pub interrupt_mode: Option<String>,

    /// Additional kernel-specific metadata
    pub metadata: Option<Value>,
}

/// An installed kernel type, as discovered in a kernelspec directory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KernelSpecEntry {
    /// The kernel type name (the name of the directory holding `kernel.json`)
    pub name: String,

    /// The directory holding `kernel.json` and any kernel resources
    pub resource_dir: String,

    /// The parsed kernelspec
    pub spec: KernelSpec,
}
