//! Coordinate lookup for inspections, backed by a persistent geocoding cache table.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use anyhow::{Context, Result};
use dinesafe_adapters::Geocoder;
use dinesafe_core::{EstablishmentKey, GeocodedAddress, Inspection};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{GeocodeSpec, TableNames};

pub type Coordinates = (Option<f64>, Option<f64>);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeocodeStats {
    pub addresses_missing: usize,
    pub cache_hits: usize,
    pub resolved: usize,
    pub not_found: usize,
    pub timeouts: usize,
    pub skipped_without_provider: usize,
    pub filled_latitude: usize,
    pub filled_longitude: usize,
}

/// Highest published latitude and longitude per establishment.
pub async fn establishment_coordinates(
    pool: &SqlitePool,
    table: &str,
) -> Result<HashMap<EstablishmentKey, Coordinates>> {
    let sql = format!(
        "SELECT establishment_id, establishmenttype, establishment_address, \
         MAX(latitude) AS latitude, MAX(longitude) AS longitude \
         FROM {table} GROUP BY establishment_id, establishmenttype, establishment_address"
    );
    let rows = sqlx::query(&sql)
        .fetch_all(pool)
        .await
        .with_context(|| format!("reading establishment coordinates of {table}"))?;

    let mut coordinates = HashMap::with_capacity(rows.len());
    for row in rows {
        let (Some(establishment_id), Some(establishment_type), Some(establishment_address)) = (
            row.try_get::<Option<i64>, _>("establishment_id")?,
            row.try_get::<Option<String>, _>("establishmenttype")?,
            row.try_get::<Option<String>, _>("establishment_address")?,
        ) else {
            continue;
        };
        coordinates.insert(
            EstablishmentKey {
                establishment_id,
                establishment_type,
                establishment_address,
            },
            (row.try_get("latitude")?, row.try_get("longitude")?),
        );
    }
    Ok(coordinates)
}

pub fn attach_coordinates(
    inspections: &mut [Inspection],
    coordinates: &HashMap<EstablishmentKey, Coordinates>,
) {
    for inspection in inspections.iter_mut() {
        let (latitude, longitude) = coordinates
            .get(&inspection.establishment_key())
            .copied()
            .unwrap_or((None, None));
        inspection.latitude = latitude;
        inspection.longitude = longitude;
    }
}

/// Capitalize the first letter of every run of letters and lower-case the rest
/// (`12TH AVE` becomes `12Th Ave`).
pub fn title_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_word = false;
    for c in input.chars() {
        if c.is_alphabetic() {
            if in_word {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(c);
            in_word = false;
        }
    }
    out
}

pub fn geocode_query(address: &str, suffix: &str) -> String {
    format!("{}{}", title_case(address), suffix)
}

/// Unique addresses of inspections still lacking a latitude or longitude.
pub fn addresses_missing_coordinates(inspections: &[Inspection]) -> Vec<String> {
    inspections
        .iter()
        .filter(|i| i.missing_coordinates())
        .map(|i| i.establishment_address.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub struct GeocodeCache<'a> {
    pool: &'a SqlitePool,
    table: &'a str,
}

impl<'a> GeocodeCache<'a> {
    pub fn new(pool: &'a SqlitePool, table: &'a str) -> Self {
        Self { pool, table }
    }

    pub async fn contains(&self, address: &str) -> Result<bool> {
        sqlx::query_scalar(&format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE address = ?)",
            self.table
        ))
        .bind(address)
        .fetch_one(self.pool)
        .await
        .with_context(|| format!("looking up `{address}` in {}", self.table))
    }

    pub async fn insert(&self, entry: &GeocodedAddress) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (address, neighbourhood, locality, formatted_address, postal_code, \
             latitude, longitude) VALUES (?, ?, ?, ?, ?, ?, ?)",
            self.table
        ))
        .bind(&entry.address)
        .bind(&entry.neighbourhood)
        .bind(&entry.locality)
        .bind(&entry.formatted_address)
        .bind(&entry.postal_code)
        .bind(entry.latitude)
        .bind(entry.longitude)
        .execute(self.pool)
        .await
        .with_context(|| format!("caching `{}` in {}", entry.address, self.table))?;
        Ok(())
    }

    /// Cached coordinates keyed by the upper-cased address without `suffix`.
    /// The first row cached for an address wins.
    pub async fn coordinates_by_address(&self, suffix: &str) -> Result<HashMap<String, Coordinates>> {
        let rows = sqlx::query(&format!(
            "SELECT UPPER(REPLACE(address, ?, '')) AS establishment_address, latitude, longitude \
             FROM {} ORDER BY rowid",
            self.table
        ))
        .bind(suffix)
        .fetch_all(self.pool)
        .await
        .with_context(|| format!("reading cached coordinates of {}", self.table))?;

        let mut cached = HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("establishment_address")?;
            cached
                .entry(key.to_uppercase())
                .or_insert((row.try_get("latitude")?, row.try_get("longitude")?));
        }
        Ok(cached)
    }
}

/// Ask the provider about every query not cached yet and persist the answers.
///
/// "Not found" answers are cached with missing coordinates; timeouts are not cached so
/// a later run asks again.
pub async fn fill_cache(
    cache: &GeocodeCache<'_>,
    geocoder: Option<&dyn Geocoder>,
    run_id: Uuid,
    queries: &[String],
    spec: &GeocodeSpec,
    stats: &mut GeocodeStats,
) -> Result<()> {
    for query in queries {
        if cache.contains(query).await? {
            debug!(address = %query, "found cached geocode; did nothing");
            stats.cache_hits += 1;
            continue;
        }
        let Some(geocoder) = geocoder else {
            stats.skipped_without_provider += 1;
            continue;
        };

        let answer = geocoder.geocode(run_id, query).await;
        match answer {
            Ok(Some(found)) => {
                cache.insert(&found).await?;
                stats.resolved += 1;
            }
            Ok(None) => {
                cache.insert(&GeocodedAddress::unresolved(query.as_str())).await?;
                stats.not_found += 1;
            }
            Err(err) if err.is_timeout() => {
                warn!(address = %query, provider = geocoder.provider(), "geocoding timed out");
                stats.timeouts += 1;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("geocoding with {}", geocoder.provider()));
            }
        }

        let pause = rand::thread_rng().gen_range(spec.min_delay_secs..=spec.max_delay_secs);
        if pause > 0 {
            tokio::time::sleep(Duration::from_secs(pause)).await;
        }
    }
    Ok(())
}

/// Fill missing latitudes and longitudes independently from cached answers.
pub fn fill_from_cache(
    inspections: &mut [Inspection],
    cached: &HashMap<String, Coordinates>,
    stats: &mut GeocodeStats,
) {
    for inspection in inspections.iter_mut() {
        if !inspection.missing_coordinates() {
            continue;
        }
        let Some((latitude, longitude)) =
            cached.get(&inspection.establishment_address.to_uppercase())
        else {
            continue;
        };
        if inspection.latitude.is_none() && latitude.is_some() {
            inspection.latitude = *latitude;
            stats.filled_latitude += 1;
        }
        if inspection.longitude.is_none() && longitude.is_some() {
            inspection.longitude = *longitude;
            stats.filled_longitude += 1;
        }
    }
}

/// Attach published coordinates, geocode what is still missing and fill it back in.
pub async fn geocode_missing_coordinates(
    pool: &SqlitePool,
    tables: &TableNames,
    inspections: &mut [Inspection],
    geocoder: Option<&dyn Geocoder>,
    spec: &GeocodeSpec,
    run_id: Uuid,
) -> Result<GeocodeStats> {
    let published = establishment_coordinates(pool, &tables.infractions).await?;
    attach_coordinates(inspections, &published);

    let queries = addresses_missing_coordinates(inspections)
        .iter()
        .map(|address| geocode_query(address, &spec.address_suffix))
        .collect::<Vec<_>>();
    let mut stats = GeocodeStats {
        addresses_missing: queries.len(),
        ..GeocodeStats::default()
    };
    if geocoder.is_none() && !queries.is_empty() {
        info!(addresses = queries.len(), "no geocoding provider configured; using cache only");
    }

    let cache = GeocodeCache::new(pool, &tables.geocoded);
    fill_cache(&cache, geocoder, run_id, &queries, spec, &mut stats).await?;

    let cached = cache.coordinates_by_address(&spec.address_suffix).await?;
    fill_from_cache(inspections, &cached, &mut stats);

    info!(
        missing = stats.addresses_missing,
        cache_hits = stats.cache_hits,
        resolved = stats.resolved,
        not_found = stats.not_found,
        timeouts = stats.timeouts,
        "geocoded missing coordinates"
    );
    Ok(stats)
}
