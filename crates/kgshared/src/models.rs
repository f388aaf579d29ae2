//
// models.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Response bodies of the gateway's HTTP API.

use serde::{Deserialize, Serialize};

/// Returned when a session is created or terminated.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionId {
    pub id: String,
}

/// Returned when a request fails.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    /// A human readable description of the failure
    pub error: String,

    /// A stable error code, e.g. `KG-2`
    pub code: String,

    /// Additional detail, if any
    pub details: Option<String>,
}
