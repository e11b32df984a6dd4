use std::path::{Component, Path};

use crate::TransferError;

/// Validates a file name before it is sent to the upload service.
///
/// The service stores merged files under the given name, so it must stay
/// relative. Rejects:
/// - Empty or whitespace-only names
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_file_name(file_name: &str) -> Result<(), TransferError> {
    if file_name.trim().is_empty() {
        return Err(TransferError::InvalidPath("empty file name".into()));
    }

    let path = Path::new(file_name);
    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {file_name}"
        )));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {file_name}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {file_name}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}
