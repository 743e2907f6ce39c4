//! Package creation: PSADT folders and `.intunewin` containers

pub mod crypto;
pub mod external;
pub mod intunewin;
pub mod psadt;

pub use external::IntuneWinAppUtil;
pub use intunewin::{ApplicationInfo, EncryptionInfo, IntuneWinPackage};
pub use psadt::{BuiltPackage, PsadtBuilder, ToolkitFlavor};
