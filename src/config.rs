//! Tiler configuration.
//!
//! The configuration is normally read from a small YAML document:
//!
//! ```yaml
//! projectId: analytics
//! tileDataset: mvt_pool
//! overscanMargin: 0.00390625
//! tileExtent: 4096
//! ```
//!
//! Every key except `projectId` is optional.

use serde::Deserialize;

use crate::error::{Error, Result};

/// Dataset (schema) holding generated tile sets.
pub const DEFAULT_TILE_DATASET: &str = "mvt_pool";
/// Overscan margin as a fraction of one tile (16 units of a 4096 extent).
pub const DEFAULT_OVERSCAN_MARGIN: f64 = 16.0 / 4096.0;
pub const DEFAULT_TILE_EXTENT: u32 = 4096;
pub const DEFAULT_LAYER_NAME: &str = "default";
pub const DEFAULT_INDEX_COLUMN: &str = "geoid";
pub const DEFAULT_GEOMETRY_COLUMN: &str = "geom";
pub const DEFAULT_MAX_ZOOM: u8 = 22;
/// Results estimated below this size are better downloaded than tiled.
pub const DEFAULT_DATA_SIZE_LIMIT: f64 = 10.0 * 1024.0 * 1024.0;

/// Upper bound on the tiles one extent may span at its zoom level.
pub const DEFAULT_MAX_TILES: u64 = 1 << 20;

/// Highest zoom a tile set may use; keeps `2^z` tile indices inside `u32`.
pub const MAX_SUPPORTED_ZOOM: u8 = 30;

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TilerConfig {
    pub project_id: String,
    #[serde(default = "default_tile_dataset")]
    pub tile_dataset: String,
    #[serde(default = "default_overscan_margin")]
    pub overscan_margin: f64,
    #[serde(default = "default_tile_extent")]
    pub tile_extent: u32,
    #[serde(default = "default_layer_name")]
    pub layer_name: String,
    #[serde(default = "default_index_column")]
    pub index_column: String,
    #[serde(default = "default_geometry_column")]
    pub geometry_column: String,
    #[serde(default = "default_max_zoom")]
    pub max_zoom: u8,
    #[serde(default = "default_data_size_limit")]
    pub data_size_limit: f64,
    #[serde(default = "default_max_tiles")]
    pub max_tiles: u64,
}

fn default_tile_dataset() -> String {
    DEFAULT_TILE_DATASET.to_string()
}

fn default_overscan_margin() -> f64 {
    DEFAULT_OVERSCAN_MARGIN
}

fn default_tile_extent() -> u32 {
    DEFAULT_TILE_EXTENT
}

fn default_layer_name() -> String {
    DEFAULT_LAYER_NAME.to_string()
}

fn default_index_column() -> String {
    DEFAULT_INDEX_COLUMN.to_string()
}

fn default_geometry_column() -> String {
    DEFAULT_GEOMETRY_COLUMN.to_string()
}

fn default_max_zoom() -> u8 {
    DEFAULT_MAX_ZOOM
}

fn default_data_size_limit() -> f64 {
    DEFAULT_DATA_SIZE_LIMIT
}

fn default_max_tiles() -> u64 {
    DEFAULT_MAX_TILES
}

impl TilerConfig {
    /// A configuration with every optional setting at its default.
    pub fn new(project_id: impl Into<String>) -> Self {
        TilerConfig {
            project_id: project_id.into(),
            tile_dataset: default_tile_dataset(),
            overscan_margin: DEFAULT_OVERSCAN_MARGIN,
            tile_extent: DEFAULT_TILE_EXTENT,
            layer_name: default_layer_name(),
            index_column: default_index_column(),
            geometry_column: default_geometry_column(),
            max_zoom: DEFAULT_MAX_ZOOM,
            data_size_limit: DEFAULT_DATA_SIZE_LIMIT,
            max_tiles: DEFAULT_MAX_TILES,
        }
    }

    /// Parses and validates a YAML configuration document.
    pub fn from_yaml(data: &str) -> Result<TilerConfig> {
        let config: TilerConfig = serde_yaml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.project_id.trim().is_empty() {
            return Err(Error::Config("projectId must not be empty".into()));
        }
        if self.tile_dataset.trim().is_empty() {
            return Err(Error::Config("tileDataset must not be empty".into()));
        }
        if self.tile_extent == 0 {
            return Err(Error::Config("tileExtent must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.overscan_margin) {
            return Err(Error::Config(format!(
                "overscanMargin must be in [0, 1), got {}",
                self.overscan_margin
            )));
        }
        if self.max_zoom > MAX_SUPPORTED_ZOOM {
            return Err(Error::Config(format!(
                "maxZoom must be at most {}, got {}",
                MAX_SUPPORTED_ZOOM, self.max_zoom
            )));
        }
        if self.layer_name.is_empty() {
            return Err(Error::Config("layerName must not be empty".into()));
        }
        if self.geometry_column.is_empty() || self.index_column.is_empty() {
            return Err(Error::Config(
                "geometryColumn and indexColumn must not be empty".into(),
            ));
        }
        if self.geometry_column == self.index_column {
            return Err(Error::Config(
                "geometryColumn and indexColumn must differ".into(),
            ));
        }
        if self.max_tiles == 0 {
            return Err(Error::Config("maxTiles must be positive".into()));
        }
        if !(self.data_size_limit >= 0.0) {
            return Err(Error::Config("dataSizeLimit must be non-negative".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Read;

    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_parse_config_file() {
        let mut file = File::open("test_data/tiler.yml").expect("Unable to open the test yml file.");
        let mut data = String::new();
        file.read_to_string(&mut data)
            .expect("Unable to read the file");

        match TilerConfig::from_yaml(&data) {
            Ok(config) => assert_eq!(TilerConfig::new("analytics"), config),
            Err(e) => panic!("{}", e),
        }
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = TilerConfig::from_yaml("projectId: analytics\n").unwrap();

        assert_eq!("analytics", config.project_id);
        assert_eq!("mvt_pool", config.tile_dataset);
        assert_eq!(4096, config.tile_extent);
        assert_approx_eq!(0.00390625, config.overscan_margin);
        assert_eq!(TilerConfig::new("analytics"), config);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = "
projectId: analytics
tileDataset: tiles
overscanMargin: 0.125
tileExtent: 512
layerName: counties
indexColumn: id
geometryColumn: the_geom
maxZoom: 14
dataSizeLimit: 2048
maxTiles: 500
";
        let config = TilerConfig::from_yaml(yaml).unwrap();

        assert_eq!("tiles", config.tile_dataset);
        assert_eq!(512, config.tile_extent);
        assert_eq!("counties", config.layer_name);
        assert_eq!("id", config.index_column);
        assert_eq!("the_geom", config.geometry_column);
        assert_eq!(14, config.max_zoom);
        assert_approx_eq!(0.125, config.overscan_margin);
        assert_approx_eq!(2048.0, config.data_size_limit);
        assert_eq!(500, config.max_tiles);
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let result = TilerConfig::from_yaml("projectId: a\ntileDatset: typo\n");
        assert!(matches!(result, Err(Error::Yaml(_))));
    }

    #[test]
    fn test_rejects_invalid_values() {
        for yaml in [
            "projectId: ''",
            "projectId: a\ntileExtent: 0",
            "projectId: a\noverscanMargin: 1.5",
            "projectId: a\noverscanMargin: -0.1",
            "projectId: a\nmaxZoom: 31",
            "projectId: a\nindexColumn: geom",
            "projectId: a\nmaxTiles: 0",
        ] {
            let result = TilerConfig::from_yaml(yaml);
            assert!(
                matches!(result, Err(Error::Config(_))),
                "expected config error for {:?}",
                yaml
            );
        }
    }
}
