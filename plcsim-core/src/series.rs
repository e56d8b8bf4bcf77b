//! Canned sensor series replayed by barometer read-outs.
//!
//! A series file maps series ids to ordered readings (Pa), in YAML or JSON:
//!
//! ```yaml
//! pump_down: [101325.0, 5000.0, 120.0, 3.5, 0.004, 0.0]
//! vent_up: [0.0, 50.0, 9000.0, 101325.0]
//! ```

use crate::error::CoreError;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Standard atmospheric pressure in Pa.
pub const ATMOSPHERIC_PRESSURE: f64 = 101_325.0;

/// Built-in series decaying from atmosphere to vacuum.
pub const PUMP_DOWN: &str = "pump_down";
/// Built-in series rising from vacuum back to atmosphere.
pub const VENT_UP: &str = "vent_up";

/// Named sensor series.
#[derive(Debug, Clone, Default)]
pub struct SeriesCatalog {
    series: BTreeMap<String, Arc<[f64]>>,
}

impl SeriesCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a catalog holding the built-in series.
    pub fn builtin() -> Self {
        // One decade per tick, then hard vacuum.
        let pump_down: Vec<f64> = (0..9)
            .map(|k| ATMOSPHERIC_PRESSURE * 10f64.powi(-k))
            .chain(std::iter::once(0.0))
            .collect();
        let vent_up: Vec<f64> = pump_down.iter().rev().copied().collect();

        let mut catalog = Self::new();
        catalog.insert(PUMP_DOWN, pump_down);
        catalog.insert(VENT_UP, vent_up);
        catalog
    }

    /// Loads series from a YAML or JSON file and merges them over the built-ins.
    pub fn with_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| CoreError::SeriesFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        // YAML is a superset of JSON, so one parser covers both.
        let loaded: BTreeMap<String, Vec<f64>> =
            serde_yaml::from_str(&content).map_err(|e| CoreError::SeriesFile {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let mut catalog = Self::builtin();
        for (name, values) in loaded {
            if values.is_empty() {
                tracing::warn!("Ignoring empty series '{}' in {}", name, path.display());
                continue;
            }
            catalog.insert(name, values);
        }

        tracing::info!(
            "Loaded sensor series from {} ({} series)",
            path.display(),
            catalog.len()
        );
        Ok(catalog)
    }

    /// Adds or replaces a series.
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f64>) {
        self.series.insert(name.into(), values.into());
    }

    /// Gets a series by id.
    pub fn get(&self, name: &str) -> Result<Arc<[f64]>, CoreError> {
        self.series
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::SeriesNotFound {
                series: name.to_string(),
            })
    }

    /// Returns the series ids.
    pub fn names(&self) -> Vec<String> {
        self.series.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_builtin_series_shape() {
        let catalog = SeriesCatalog::builtin();
        let down = catalog.get(PUMP_DOWN).unwrap();
        assert_eq!(down.first(), Some(&ATMOSPHERIC_PRESSURE));
        assert_eq!(down.last(), Some(&0.0));
        assert!(down.windows(2).all(|w| w[0] > w[1]));

        let up = catalog.get(VENT_UP).unwrap();
        assert_eq!(up.first(), Some(&0.0));
        assert_eq!(up.last(), Some(&ATMOSPHERIC_PRESSURE));
    }

    #[test]
    fn test_unknown_series() {
        let catalog = SeriesCatalog::builtin();
        assert!(matches!(
            catalog.get("Sheet9"),
            Err(CoreError::SeriesNotFound { .. })
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "quick: [5.0, 1.0, 0.0]").unwrap();
        writeln!(file, "empty: []").unwrap();

        let catalog = SeriesCatalog::with_file(file.path()).unwrap();
        assert_eq!(&*catalog.get("quick").unwrap(), &[5.0, 1.0, 0.0]);
        assert!(catalog.get("empty").is_err());
        assert!(catalog.get(PUMP_DOWN).is_ok());
    }

    #[test]
    fn test_missing_file() {
        let err = SeriesCatalog::with_file("/nonexistent/series.yaml").unwrap_err();
        assert!(matches!(err, CoreError::SeriesFile { .. }));
    }
}
