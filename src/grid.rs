use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::models::{CellGeometry, CellId};

#[derive(Deserialize)]
struct FeatureCollection {
    features: Vec<Feature>,
}

#[derive(Deserialize)]
struct Feature {
    properties: Properties,
    geometry: serde_json::Value,
}

#[derive(Deserialize)]
struct Properties {
    id: CellId,
}

/// Reads grid cells from a GeoJSON `FeatureCollection` whose features carry
/// an integer `id` property.
pub fn load_cells(path: &Path) -> anyhow::Result<HashMap<CellId, CellGeometry>> {
    tracing::info!(path = %path.display(), "read polygons");
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read grid file {}", path.display()))?;
    let cells = parse_cells(&raw)
        .with_context(|| format!("invalid grid file {}", path.display()))?;
    tracing::info!(cells = cells.len(), "finished reading polygons");
    Ok(cells)
}

pub fn parse_cells(geojson: &str) -> anyhow::Result<HashMap<CellId, CellGeometry>> {
    let collection: FeatureCollection = serde_json::from_str(geojson)?;
    let mut cells = HashMap::with_capacity(collection.features.len());
    for feature in collection.features {
        if cells
            .insert(feature.properties.id, CellGeometry(feature.geometry))
            .is_some()
        {
            anyhow::bail!("duplicate cell id {}", feature.properties.id);
        }
    }
    Ok(cells)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRID: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {
                "type": "Feature",
                "properties": { "id": 17 },
                "geometry": { "type": "Polygon", "coordinates": [[[0, 0], [1, 0], [1, 1], [0, 0]]] }
            },
            {
                "type": "Feature",
                "properties": { "id": 18, "name": "east" },
                "geometry": { "type": "Polygon", "coordinates": [[[1, 0], [2, 0], [2, 1], [1, 0]]] }
            }
        ]
    }"#;

    #[test]
    fn reads_cells_by_id() {
        let cells = parse_cells(GRID).unwrap();
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[&17].0["type"], "Polygon");
        assert_eq!(cells[&18].0["coordinates"][0][1][0], 2);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let duplicated = GRID.replace("\"id\": 18", "\"id\": 17");
        assert!(parse_cells(&duplicated).is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.geojson");
        std::fs::write(&path, GRID).unwrap();
        assert_eq!(load_cells(&path).unwrap().len(), 2);
        assert!(load_cells(&dir.path().join("missing.geojson")).is_err());
    }
}
