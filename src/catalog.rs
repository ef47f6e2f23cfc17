// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use canonical_error::{invalid_argument_error, not_found_error, CanonicalError};
use log::info;
use serde::Deserialize;

use crate::astro_util::haversine_dist;
use crate::context::{CelestialObject, Environment, ObjectKind};

#[derive(Debug, Deserialize)]
struct CatalogRow {
    id: String,
    name: String,
    ra_deg: f64,
    dec_deg: f64,
    v_mag: f64,
    kind: String,
}

/// Name normalization shared by lookups and the row loader: case and
/// whitespace insensitive, catalog placeholder dashes stripped.
pub fn normalize_name(name: &str) -> String {
    name.trim().trim_matches('-').trim().to_lowercase()
}

/// The star/DSO table, loaded once at startup and immutable thereafter.
#[derive(Debug)]
pub struct Catalog {
    entries: Vec<CelestialObject>,
    by_name: HashMap<String, usize>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self, CanonicalError> {
        if !path.exists() {
            return Err(not_found_error(
                format!("star catalog not found at {}", path.display())
                    .as_str(),
            ));
        }
        let start = Instant::now();
        let mut reader = csv::Reader::from_path(path).map_err(|e| {
            invalid_argument_error(
                format!("cannot open {}: {}", path.display(), e).as_str(),
            )
        })?;

        let mut entries = Vec::new();
        for row in reader.deserialize::<CatalogRow>() {
            let row = row.map_err(|e| {
                invalid_argument_error(
                    format!("bad catalog row in {}: {}", path.display(), e)
                        .as_str(),
                )
            })?;
            let kind = match row.kind.trim().to_lowercase().as_str() {
                "star" => ObjectKind::Star,
                "dso" => ObjectKind::Dso,
                other => {
                    return Err(invalid_argument_error(
                        format!("unknown catalog kind '{}'", other).as_str(),
                    ));
                }
            };
            let name = if normalize_name(&row.name).is_empty() {
                row.id.clone() // Unnamed entries show their catalog id.
            } else {
                row.name.trim().to_string()
            };
            entries.push(CelestialObject {
                name,
                ra: row.ra_deg,
                dec: row.dec_deg,
                magnitude: row.v_mag,
                kind,
                catalog_id: Some(row.id),
            });
        }

        let mut by_name = HashMap::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            by_name.entry(normalize_name(&entry.name)).or_insert(index);
        }
        info!(
            "Loaded {} catalog entries from {} in {:.2}s",
            entries.len(),
            path.display(),
            start.elapsed().as_secs_f64()
        );
        Ok(Catalog { entries, by_name })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Case-insensitive, whitespace-trimmed name lookup.
    pub fn search_by_name(&self, name: &str) -> Option<&CelestialObject> {
        self.by_name
            .get(&normalize_name(name))
            .map(|&index| &self.entries[index])
    }

    /// Entries within `radius_deg` great-circle degrees of (ra, dec), no
    /// fainter than `mag_limit`, nearest first.
    pub fn search_by_coordinate(
        &self,
        ra: f64,
        dec: f64,
        radius_deg: f64,
        mag_limit: f64,
    ) -> Vec<CelestialObject> {
        let mut matches: Vec<(f64, &CelestialObject)> = self
            .entries
            .iter()
            .filter(|entry| entry.magnitude <= mag_limit)
            .filter_map(|entry| {
                let separation =
                    haversine_dist(ra, dec, entry.ra, entry.dec);
                (separation <= radius_deg).then_some((separation, entry))
            })
            .collect();
        matches.sort_by(|a, b| a.0.total_cmp(&b.0));
        matches.into_iter().map(|(_, entry)| entry.clone()).collect()
    }

    /// Named stars at or brighter than `mag_limit`, brightest first.
    pub fn bright_stars(&self, mag_limit: f64) -> Vec<CelestialObject> {
        self.listing(ObjectKind::Star, mag_limit)
    }

    /// Deep-sky objects at or brighter than `mag_limit`, brightest first.
    pub fn dsos(&self, mag_limit: f64) -> Vec<CelestialObject> {
        self.listing(ObjectKind::Dso, mag_limit)
    }

    fn listing(&self, kind: ObjectKind, mag_limit: f64) -> Vec<CelestialObject> {
        let mut result: Vec<CelestialObject> = self
            .entries
            .iter()
            .filter(|entry| entry.kind == kind && entry.magnitude <= mag_limit)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.magnitude.total_cmp(&b.magnitude));
        result
    }
}

/// Drops objects at or below the environment's minimum visible altitude.
pub fn filter_visible(
    objects: Vec<CelestialObject>,
    environment: &Environment,
) -> Vec<CelestialObject> {
    objects
        .into_iter()
        .filter(|object| environment.is_target_visible(object.ra, object.dec))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;

    use super::*;

    fn write_catalog(lines: &str) -> PathBuf {
        static NEXT_ID: std::sync::atomic::AtomicU32 =
            std::sync::atomic::AtomicU32::new(0);
        let unique = NEXT_ID.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "astroflo_catalog_test_{}_{}.csv",
            std::process::id(),
            unique
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "id,name,ra_deg,dec_deg,v_mag,kind").unwrap();
        write!(file, "{}", lines).unwrap();
        path
    }

    fn sample_catalog() -> Catalog {
        let path = write_catalog(
            "HIP91262,Vega,279.2437,38.7861,0.03,star\n\
             HIP97649,Altair,297.70505,8.8712,0.76,star\n\
             HIP65378, Mizar ,200.98349,54.9302,2.23,star\n\
             TYC1234,--,201.1,54.8,9.5,star\n\
             M45,Pleiades,56.74689,24.116,1.6,dso\n\
             M31,Andromeda Galaxy,10.685,41.269,3.4,dso\n",
        );
        let catalog = Catalog::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        catalog
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let err =
            Catalog::load(Path::new("/nonexistent/tyc.csv")).unwrap_err();
        assert!(err.message.contains("not found"));
    }

    #[test]
    fn test_name_lookup_is_normalized() {
        let catalog = sample_catalog();
        assert_eq!(catalog.len(), 6);
        let vega = catalog.search_by_name("  VEGA ").unwrap();
        assert_eq!(vega.ra, 279.2437);
        // Whitespace in the table itself is also tolerated.
        assert!(catalog.search_by_name("mizar").is_some());
        assert!(catalog.search_by_name("sirius").is_none());
    }

    #[test]
    fn test_unnamed_entry_falls_back_to_id() {
        let catalog = sample_catalog();
        let entry = catalog.search_by_name("TYC1234").unwrap();
        assert_eq!(entry.name, "TYC1234");
    }

    #[test]
    fn test_radius_search_with_magnitude_ceiling() {
        let catalog = sample_catalog();
        // Mizar and its faint neighbor are within a degree of each other.
        let nearby =
            catalog.search_by_coordinate(200.98349, 54.9302, 1.0, 13.0);
        assert_eq!(nearby.len(), 2);
        assert_eq!(nearby[0].name, "Mizar"); // Nearest first.

        let bright_only =
            catalog.search_by_coordinate(200.98349, 54.9302, 1.0, 6.0);
        assert_eq!(bright_only.len(), 1);
        assert_eq!(bright_only[0].name, "Mizar");

        assert!(catalog
            .search_by_coordinate(0.0, -60.0, 1.0, 13.0)
            .is_empty());
    }

    #[test]
    fn test_listings_split_by_kind() {
        let catalog = sample_catalog();
        let stars = catalog.bright_stars(3.0);
        assert_eq!(stars.len(), 3);
        assert_eq!(stars[0].name, "Vega"); // Brightest first.
        let dsos = catalog.dsos(5.0);
        assert_eq!(dsos.len(), 2);
        assert_eq!(dsos[0].name, "Pleiades");
    }
}
