//! JSON file persistence for discovered endpoints.

use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EndpointError, Result};
use crate::types::Endpoint;

/// A discovered endpoint together with its expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedEndpoint {
    /// The discovered endpoint.
    #[serde(flatten)]
    pub endpoint: Endpoint,
    /// Missing in files written before expiries were recorded.
    #[serde(rename = "expireTime", default, skip_serializing_if = "Option::is_none")]
    pub expire_time: Option<DateTime<Utc>>,
}

/// Writes `endpoints` as a JSON array, replacing the file atomically.
pub fn write_endpoints(path: &Path, endpoints: &[SavedEndpoint]) -> Result<()> {
    let persistence = |reason: String| EndpointError::Persistence {
        path: path.to_path_buf(),
        reason,
    };

    let data = serde_json::to_vec_pretty(endpoints).map_err(|e| persistence(e.to_string()))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(&data)?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Reads a JSON array of endpoints.
pub fn read_endpoints(path: &Path) -> Result<Vec<SavedEndpoint>> {
    let data = std::fs::read(path).map_err(|e| EndpointError::Persistence {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    serde_json::from_slice(&data).map_err(|e| EndpointError::Persistence {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EndpointType;

    #[test]
    fn test_write_creates_parent_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state").join("endpoints.json");
        let endpoints = vec![SavedEndpoint {
            endpoint: Endpoint::new("CN=a", "a", EndpointType::EdgeNode),
            expire_time: Some(Utc::now()),
        }];

        write_endpoints(&path, &endpoints).expect("write");

        assert_eq!(read_endpoints(&path).expect("read"), endpoints);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_read_endpoint_without_expiry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("endpoints.json");
        std::fs::write(&path, br#"[{"id": "CN=a", "name": "a"}]"#).expect("write");

        let saved = read_endpoints(&path).expect("read");
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].endpoint.name, "a");
        assert_eq!(saved[0].expire_time, None);
    }

    #[test]
    fn test_read_garbage_is_persistence_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("endpoints.json");
        std::fs::write(&path, b"{not json").expect("write");

        assert!(matches!(
            read_endpoints(&path),
            Err(EndpointError::Persistence { .. })
        ));
    }
}
