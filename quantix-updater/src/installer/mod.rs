//! Package installers: components that apply a downloaded package to the
//! application directory and report every file they wrote.

mod archive;

pub use archive::{ArchiveFormat, ArchiveInstaller};

use std::path::{Path, PathBuf};

use crate::component::Component;
use crate::error::UpdateError;

/// A component that installs a package file into a target directory.
pub trait PackageInstaller: Component {
    /// Set the package and target. Rejected unless `Initializing`.
    fn configure(&self, package_file: &Path, target_directory: &Path) -> Result<(), UpdateError>;

    /// Absolute paths written so far.
    ///
    /// Still populated after a failure or cancellation so the caller can
    /// roll back partial output.
    fn installed_file_paths(&self) -> Vec<PathBuf>;
}
