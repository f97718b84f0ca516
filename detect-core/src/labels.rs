//! Label-file loading. A label file is a plain list of class names separated
//! by whitespace, in network class order.

use std::path::Path;

use crate::error::{Error, Result};

pub fn load(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("cannot read label file {}: {e}", path.display()))
    })?;
    Ok(raw.split_whitespace().map(str::to_owned).collect())
}

/// Resolve a 1-based label id against the label list. Ids the network emits
/// outside the label table render as `"unknown"` rather than failing the
/// request.
pub fn resolve(labels: &[String], label_id: i32) -> String {
    usize::try_from(label_id - 1)
        .ok()
        .and_then(|idx| labels.get(idx))
        .cloned()
        .unwrap_or_else(|| "unknown".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_is_one_based() {
        let labels = vec!["person".to_owned(), "bicycle".to_owned()];
        assert_eq!(resolve(&labels, 1), "person");
        assert_eq!(resolve(&labels, 2), "bicycle");
    }

    #[test]
    fn out_of_range_ids_fall_back() {
        let labels = vec!["person".to_owned()];
        assert_eq!(resolve(&labels, 0), "unknown");
        assert_eq!(resolve(&labels, -3), "unknown");
        assert_eq!(resolve(&labels, 99), "unknown");
    }
}
