//! Release metadata pulled from the extracted tree: process types from
//! the Procfile, Dockerfile contents for container builds.

use crate::build::stacks::Stack;
use crate::errors::BuildError;
use std::collections::BTreeMap;
use std::path::Path;

pub type ProcessTypes = BTreeMap<String, String>;

/// Parse the tree's Procfile. Every build needs one; the release cannot
/// be registered without process types.
pub fn process_types(dir: &Path) -> Result<ProcessTypes, BuildError> {
    let path = dir.join("Procfile");
    if !path.exists() {
        return Err(BuildError::MissingProcfile {
            dir: dir.to_path_buf(),
        });
    }
    let raw = std::fs::read_to_string(&path).map_err(|source| BuildError::FileRead {
        path: path.clone(),
        source,
    })?;
    serde_yaml::from_str::<ProcessTypes>(&raw).map_err(|err| BuildError::MalformedProcfile {
        dir: dir.to_path_buf(),
        message: err.to_string(),
    })
}

/// Contents of the Dockerfile, attached to the release only when the
/// container stack built it. Other stacks report empty contents.
pub fn dockerfile_contents(dir: &Path, stack: &Stack) -> Result<String, BuildError> {
    if stack.name != "container" {
        return Ok(String::new());
    }
    let path = dir.join("Dockerfile");
    if !path.exists() {
        return Ok(String::new());
    }
    std::fs::read_to_string(&path).map_err(|source| BuildError::FileRead { path, source })
}
