// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

/* Linux */
#[cfg(any(doc, target_os = "linux"))]
pub mod linux;

#[cfg(target_os = "linux")]
pub use linux::*;
