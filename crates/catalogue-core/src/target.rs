//! Parsing of the `resultid` option.

use std::fmt;
use std::str::FromStr;

use crate::error::CatalogueError;

/// Below this, a bare integer names a position in the channel's result
/// buffer rather than a catalogue identifier.
pub const LOCAL_INDEX_LIMIT: i64 = 100;

/// A reference to a document: a position in the channel's result buffer or
/// an identifier in the backend.
///
/// | Input | Meaning |
/// |-------|---------|
/// | `3` | local index 3 |
/// | `#150` | local index 150 |
/// | `id:42` | external identifier `42` |
/// | `991170525505504` | external identifier (integer ≥ 100 or non-numeric) |
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetRef {
    Index(usize),
    External(String),
}

impl TargetRef {
    /// The label used in similarity query text (`similar:<label> - <title>`).
    pub fn label(&self) -> String {
        match self {
            TargetRef::Index(i) => i.to_string(),
            TargetRef::External(id) => id.clone(),
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetRef::Index(i) => write!(f, "#{}", i),
            TargetRef::External(id) => write!(f, "id:{}", id),
        }
    }
}

impl FromStr for TargetRef {
    type Err = CatalogueError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CatalogueError::MissingRequiredOption("result ID".into()));
        }

        if let Some(id) = raw.strip_prefix("id:") {
            let id = id.trim();
            if id.is_empty() {
                return Err(CatalogueError::MissingRequiredOption("result ID".into()));
            }
            return Ok(TargetRef::External(id.to_string()));
        }

        if let Some(index) = raw.strip_prefix('#') {
            return index
                .trim()
                .parse::<usize>()
                .map(TargetRef::Index)
                .map_err(|_| CatalogueError::InvalidOption(format!("Invalid result ID {}", raw)));
        }

        match raw.parse::<i64>() {
            Ok(n) if n < 0 => Err(CatalogueError::InvalidOption(format!(
                "Invalid result ID {}",
                raw
            ))),
            Ok(n) if n < LOCAL_INDEX_LIMIT => Ok(TargetRef::Index(n as usize)),
            _ => Ok(TargetRef::External(raw.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_integer_is_local_index() {
        assert_eq!("3".parse::<TargetRef>().unwrap(), TargetRef::Index(3));
        assert_eq!(" 99 ".parse::<TargetRef>().unwrap(), TargetRef::Index(99));
    }

    #[test]
    fn test_large_integer_is_external() {
        assert_eq!(
            "100".parse::<TargetRef>().unwrap(),
            TargetRef::External("100".into())
        );
        assert_eq!(
            "991170525505504".parse::<TargetRef>().unwrap(),
            TargetRef::External("991170525505504".into())
        );
    }

    #[test]
    fn test_explicit_prefixes_win() {
        assert_eq!(
            "id:7".parse::<TargetRef>().unwrap(),
            TargetRef::External("7".into())
        );
        assert_eq!("#150".parse::<TargetRef>().unwrap(), TargetRef::Index(150));
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            "".parse::<TargetRef>(),
            Err(CatalogueError::MissingRequiredOption(_))
        ));
        assert!(matches!(
            "id:".parse::<TargetRef>(),
            Err(CatalogueError::MissingRequiredOption(_))
        ));
        assert!(matches!(
            "-1".parse::<TargetRef>(),
            Err(CatalogueError::InvalidOption(_))
        ));
        assert!(matches!(
            "#x".parse::<TargetRef>(),
            Err(CatalogueError::InvalidOption(_))
        ));
    }

    #[test]
    fn test_non_numeric_is_external() {
        assert_eq!(
            "abc-12".parse::<TargetRef>().unwrap(),
            TargetRef::External("abc-12".into())
        );
    }
}
