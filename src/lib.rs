//! Package Win32 apps with PSADT, wrap them as `.intunewin` and publish them
//! to Microsoft Intune through Microsoft Graph.

pub mod cmd;
pub mod config;
pub mod detection;
pub mod error;
pub mod graph;
pub mod manifest;
pub mod packaging;
pub mod wdac;

pub use error::{IntunePackError, Result};
