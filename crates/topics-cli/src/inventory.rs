use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use topics_core::{InstalledApps, TopicsError};

/// Installed-app inventory kept in a text file, one app id per line.
/// Blank lines and `#` comments are ignored. The file is read on every query.
pub struct InventoryFile {
    path: PathBuf,
}

impl InventoryFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl InstalledApps for InventoryFile {
    fn installed_apps(&self) -> topics_core::Result<HashSet<String>> {
        let content = fs::read_to_string(&self.path).map_err(TopicsError::storage)?;
        Ok(parse_inventory(&content))
    }
}

pub fn parse_inventory(content: &str) -> HashSet<String> {
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inventory_skips_comments_and_blanks() {
        let apps = parse_inventory("# installed\ncom.a\n\n  com.b  # pinned\ncom.a\n");
        assert_eq!(apps, HashSet::from(["com.a".to_string(), "com.b".to_string()]));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = InventoryFile::new(dir.path().join("nope.txt"));
        assert!(matches!(
            inventory.installed_apps(),
            Err(TopicsError::Storage(_))
        ));
    }
}
