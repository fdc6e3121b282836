//! Small helpers shared by integrations.

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Convert a name to an entity-safe slug.
pub fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
        // Collapse multiple underscores
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Slug limited to `max_len` characters, without a trailing underscore.
pub fn slugify_max(name: &str, max_len: usize) -> String {
    let slug: String = slugify(name).chars().take(max_len).collect();
    slug.trim_end_matches('_').to_string()
}

/// A value is a valid slug when slugifying it is a no-op.
pub fn is_slug(value: &str) -> bool {
    !value.is_empty() && slugify(value) == value
}

/// On-disk envelope for JSON stores under the storage directory.
#[derive(Debug, Serialize, Deserialize)]
pub struct StoreFile<T> {
    pub key: String,
    pub version: u32,
    pub data: T,
}

/// Path of the JSON store named `key` inside `dir`.
pub fn store_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{}.json", key))
}

/// Load a JSON store. A missing file yields `None`.
pub fn load_store<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<StoreFile<T>>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&contents)?))
}

/// Write a JSON store atomically (temp file + rename).
pub fn save_store<T: Serialize>(path: &Path, key: &str, version: u32, data: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = StoreFile {
        key: key.to_string(),
        version,
        data,
    };
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Living Room"), "living_room");
        assert_eq!(slugify("Couch Lamp #1"), "couch_lamp_1");
        assert_eq!(slugify("  Kitchen  "), "kitchen");
        assert_eq!(slugify("hallway-motion"), "hallway_motion");
    }

    #[test]
    fn test_slugify_max() {
        assert_eq!(slugify_max("A very long location name here", 19), "a_very_long_locatio");
        assert_eq!(slugify_max("abc def", 4), "abc");
    }

    #[test]
    fn test_is_slug() {
        assert!(is_slug("test_1"));
        assert!(!is_slug("name with space"));
        assert!(!is_slug("Upper"));
        assert!(!is_slug(""));
    }

    #[test]
    fn test_store_round_trip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(dir.path(), "thing");
        assert!(load_store::<Vec<u32>>(&path).unwrap().is_none());

        save_store(&path, "thing", 1, &vec![1u32, 2]).unwrap();
        let loaded = load_store::<Vec<u32>>(&path).unwrap().unwrap();
        assert_eq!(loaded.key, "thing");
        assert_eq!(loaded.data, vec![1, 2]);
    }
}
