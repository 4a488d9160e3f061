//! Some useful tools for the project.
//!
//! Usually, you don't need to use this module directly.

use std::ffi::OsString;
use std::path::PathBuf;

/// Modify the file stem of the path, keeping its extension.
pub(crate) trait SetFileStem {
    fn set_file_stem(&mut self, stem: impl Into<OsString>);
}

impl SetFileStem for PathBuf {
    fn set_file_stem(&mut self, stem: impl Into<OsString>) {
        let mut stem: OsString = stem.into();
        if let Some(extension) = self.extension() {
            stem.push(".");
            stem.push(extension);
        }

        self.set_file_name(stem);
    }
}
