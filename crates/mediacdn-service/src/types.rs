//! The logical addressing scheme shared by the store, the origin client and the endpoints.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Name of the staging directory inside the store root.
///
/// The series component of an [`ObjectKey`] may never be equal to this.
pub const STAGING_DIR: &str = ".tmp";

/// Reasons why a decoded path component cannot be used as part of an [`ObjectKey`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("the {0} component is empty")]
    Empty(&'static str),
    #[error("the {0} component is a relative path reference")]
    Traversal(&'static str),
    #[error("the {0} component contains a path separator")]
    Separator(&'static str),
    #[error("the {0} component contains a NUL byte")]
    Nul(&'static str),
    #[error("the series name `{STAGING_DIR}` is reserved")]
    Reserved,
}

/// Identifies one object by `series/type/filename`.
///
/// All components are already percent-decoded and validated, so joining them onto a base
/// directory can never escape it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    series: String,
    ty: String,
    filename: String,
}

/// Checks that a single decoded path component stays within its parent directory.
///
/// `name` identifies the component in the error.
pub fn validate_component(component: &str, name: &'static str) -> Result<(), KeyError> {
    if component.is_empty() {
        return Err(KeyError::Empty(name));
    }
    if component == "." || component == ".." {
        return Err(KeyError::Traversal(name));
    }
    if component.contains(['/', '\\']) {
        return Err(KeyError::Separator(name));
    }
    if component.contains('\0') {
        return Err(KeyError::Nul(name));
    }
    Ok(())
}

impl ObjectKey {
    pub fn new(
        series: impl Into<String>,
        ty: impl Into<String>,
        filename: impl Into<String>,
    ) -> Result<Self, KeyError> {
        let (series, ty, filename) = (series.into(), ty.into(), filename.into());
        validate_component(&series, "series")?;
        validate_component(&ty, "type")?;
        validate_component(&filename, "filename")?;
        if series == STAGING_DIR {
            return Err(KeyError::Reserved);
        }

        Ok(Self {
            series,
            ty,
            filename,
        })
    }

    pub fn series(&self) -> &str {
        &self.series
    }

    pub fn ty(&self) -> &str {
        &self.ty
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// The components in addressing order.
    pub fn segments(&self) -> [&str; 3] {
        [&self.series, &self.ty, &self.filename]
    }

    /// The location of this object below `base`.
    pub fn path_in(&self, base: &Path) -> PathBuf {
        base.join(&self.series).join(&self.ty).join(&self.filename)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.series, self.ty, self.filename)
    }
}
