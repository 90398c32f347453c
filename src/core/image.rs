//! Purpose: Read the names a dynamic loader matches a shared-library image by.
//! Exports: `ImageNames`, `read_image_names`.
//! Role: Gives the resolver the ELF `DT_SONAME` and `DT_NEEDED` entries of a library file.
//! Invariants: Files that are not ELF images yield empty names, never an error; loading reports those.
use std::path::Path;

use goblin::elf::Elf;

use crate::core::error::{Error, io_error};

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ImageNames {
    /// `DT_SONAME`; the name other images' `DT_NEEDED` entries bind against.
    pub soname: Option<String>,
    pub needed: Vec<String>,
}

pub fn read_image_names(path: impl AsRef<Path>) -> Result<ImageNames, Error> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .map_err(|err| io_error(err, path).with_message("failed to read library image"))?;
    Ok(parse_image_names(&bytes))
}

fn parse_image_names(bytes: &[u8]) -> ImageNames {
    match Elf::parse(bytes) {
        Ok(elf) => ImageNames {
            soname: elf.soname.map(str::to_string),
            needed: elf.libraries.iter().map(|name| name.to_string()).collect(),
        },
        Err(err) => {
            tracing::trace!(error = %err, "not an ELF image");
            ImageNames::default()
        }
    }
}
