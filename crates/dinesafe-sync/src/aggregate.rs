//! Aggregation of infraction rows into one row per inspection.

use std::collections::{BTreeMap, HashSet};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use dinesafe_core::{Inspection, PivotColumn, PivotSource, SeverityBucket, COUNTED_SEVERITIES};
use sqlx::sqlite::SqlitePool;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::info;

const FIXED_COUNT_COLUMNS: [&str; 5] = [
    "num_significant",
    "num_crucial",
    "num_minor",
    "num_na",
    "num_infractions",
];

/// Lower-case `value` and collapse every run of non-alphanumeric characters to `_`.
pub fn pivot_slug(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut pending_separator = false;
    for c in value.chars() {
        if c.is_alphanumeric() {
            if pending_separator && !slug.is_empty() {
                slug.push('_');
            }
            pending_separator = false;
            slug.extend(c.to_lowercase());
        } else {
            pending_separator = true;
        }
    }
    slug
}

fn assign_pivot_names(values: Vec<(PivotSource, Option<String>)>) -> Vec<PivotColumn> {
    let mut used: HashSet<String> = FIXED_COUNT_COLUMNS.iter().map(|s| s.to_string()).collect();
    values
        .into_iter()
        .map(|(source, value)| {
            let slug = match value.as_deref() {
                None => "null".to_string(),
                Some(v) => {
                    let slug = pivot_slug(v);
                    if slug.is_empty() {
                        "value".to_string()
                    } else {
                        slug
                    }
                }
            };
            let base = format!("num_{slug}");
            let mut name = base.clone();
            let mut n = 2;
            while !used.insert(name.clone()) {
                name = format!("{base}_{n}");
                n += 1;
            }
            PivotColumn {
                source,
                value,
                name,
            }
        })
        .collect()
}

/// One count column per distinct action and court outcome in the whole table,
/// missing values included.
pub async fn pivot_columns(pool: &SqlitePool, table: &str) -> Result<Vec<PivotColumn>> {
    let mut values = Vec::new();
    for source in [PivotSource::Action, PivotSource::CourtOutcome] {
        let column = source.column().name();
        let distinct: Vec<Option<String>> =
            sqlx::query_scalar(&format!("SELECT DISTINCT {column} FROM {table} ORDER BY {column}"))
                .fetch_all(pool)
                .await
                .with_context(|| format!("reading distinct {column} of {table}"))?;
        values.extend(distinct.into_iter().map(|v| (source, v)));
    }
    Ok(assign_pivot_names(values))
}

/// Collapse infraction rows into inspections.
///
/// Rows are first grouped per inspection and action/court outcome combination. Severity
/// counts sum the rows of every combination; pivot counts count the combinations, so two
/// infractions with the same action and outcome add one to that action's count.
pub async fn aggregate_inspections(
    pool: &SqlitePool,
    table: &str,
    establishment_types: &[String],
    pivots: &[PivotColumn],
) -> Result<Vec<Inspection>> {
    let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT establishment_id, establishmenttype, establishment_address, inspection_date, \
         inspection_id, establishment_status, \
         GROUP_CONCAT(infractions_summary, '. ') AS infractions_summary",
    );
    for column in FIXED_COUNT_COLUMNS {
        query.push(format!(", SUM({column}) AS {column}"));
    }

    // Pivot names are arbitrary text; internal aliases keep them out of the SQL.
    for (index, pivot) in pivots.iter().enumerate() {
        query.push(format!(", SUM(CASE WHEN {} ", pivot.source.column().name()));
        match &pivot.value {
            Some(value) => {
                query.push("= ");
                query.push_bind(value.clone());
            }
            None => {
                query.push("IS NULL");
            }
        }
        query.push(format!(" THEN 1 ELSE 0 END) AS pivot_{index}"));
    }

    query.push(
        " FROM (SELECT establishment_id, establishmenttype, establishment_address, \
         inspection_date, inspection_id, establishment_status, action, court_outcome, \
         GROUP_CONCAT(infraction_details, '. ') AS infractions_summary",
    );
    for bucket in SeverityBucket::ALL {
        query.push(", SUM(CASE WHEN severity LIKE ");
        query.push_bind(bucket.like_pattern());
        query.push(format!(" THEN 1 ELSE 0 END) AS {}", bucket.count_column()));
    }
    query.push(", COUNT(infraction_details) AS num_infractions");

    query.push(format!(" FROM {table} WHERE (severity IS NULL OR severity IN ("));
    {
        let mut severities = query.separated(", ");
        for severity in COUNTED_SEVERITIES {
            severities.push_bind(severity);
        }
    }
    query.push("))");
    if !establishment_types.is_empty() {
        query.push(" AND establishmenttype IN (");
        {
            let mut types = query.separated(", ");
            for establishment_type in establishment_types {
                types.push_bind(establishment_type.clone());
            }
        }
        query.push(")");
    }
    query.push(
        " GROUP BY establishment_id, establishmenttype, establishment_address, \
         inspection_date, inspection_id, establishment_status, action, court_outcome) \
         GROUP BY establishment_id, establishmenttype, establishment_address, \
         inspection_date, inspection_id, establishment_status \
         ORDER BY establishment_id, establishmenttype, establishment_address, \
         inspection_date, inspection_id",
    );

    let rows = query
        .build()
        .fetch_all(pool)
        .await
        .with_context(|| format!("aggregating infractions of {table}"))?;

    let mut inspections = Vec::with_capacity(rows.len());
    for row in rows {
        let raw_date: String = row.try_get("inspection_date")?;
        let inspection_date = NaiveDate::parse_from_str(&raw_date, "%Y-%m-%d")
            .with_context(|| format!("parsing inspection_date `{raw_date}` of {table}"))?;

        let mut pivot_counts = BTreeMap::new();
        for (index, pivot) in pivots.iter().enumerate() {
            let alias = format!("pivot_{index}");
            pivot_counts.insert(pivot.name.clone(), row.try_get::<i64, _>(alias.as_str())?);
        }

        inspections.push(Inspection {
            establishment_id: row.try_get("establishment_id")?,
            establishment_type: row.try_get("establishmenttype")?,
            establishment_address: row.try_get("establishment_address")?,
            inspection_date,
            inspection_id: row.try_get("inspection_id")?,
            establishment_status: row
                .try_get::<Option<String>, _>("establishment_status")?
                .unwrap_or_default(),
            infractions_summary: row.try_get("infractions_summary")?,
            num_significant: row.try_get("num_significant")?,
            num_crucial: row.try_get("num_crucial")?,
            num_minor: row.try_get("num_minor")?,
            num_na: row.try_get("num_na")?,
            num_infractions: row.try_get("num_infractions")?,
            pivot_counts,
            days_since_previous: None,
            latitude: None,
            longitude: None,
            is_infraction: None,
        });
    }

    info!(table, inspections = inspections.len(), pivots = pivots.len(), "aggregated infractions");
    Ok(inspections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableNames;
    use crate::db::{load_snapshots, prepare_database, SnapshotRecords};
    use crate::test_support::{memory_pool, record, snapshot};
    use dinesafe_core::TargetSchema;

    #[test]
    fn slugs_collapse_punctuation_runs() {
        assert_eq!(
            pivot_slug("Conviction - Fined & Closure"),
            "conviction_fined_closure"
        );
        assert_eq!(pivot_slug("Notice to Comply"), "notice_to_comply");
        assert_eq!(pivot_slug("  Charged -- "), "charged");
        assert_eq!(pivot_slug("---"), "");
    }

    #[test]
    fn pivot_names_are_unique() {
        let pivots = assign_pivot_names(vec![
            (PivotSource::Action, None),
            (PivotSource::Action, Some("Closed".into())),
            (PivotSource::Action, Some("Significant".into())),
            (PivotSource::CourtOutcome, None),
            (PivotSource::CourtOutcome, Some("closed!".into())),
            (PivotSource::CourtOutcome, Some("-".into())),
        ]);
        let names = pivots.iter().map(|p| p.name.as_str()).collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "num_null",
                "num_closed",
                "num_significant_2",
                "num_null_2",
                "num_closed_2",
                "num_value",
            ]
        );
    }

    #[tokio::test]
    async fn infractions_collapse_into_inspections() {
        let pool = memory_pool().await;
        let tables = TableNames::default();
        let schema = TargetSchema::default();
        prepare_database(&pool, &tables, &schema).await.unwrap();

        let id = snapshot("20190116215713");
        let mut significant = record(&id, 1, 10, "2019-01-02", Some("S - Significant"));
        significant.infraction_details = Some("FAIL TO PROTECT FOOD".into());
        let mut minor = record(&id, 1, 10, "2019-01-02", Some("M - Minor"));
        minor.infraction_details = Some("FAIL TO CLEAN".into());
        minor.action = Some("Ticket".into());
        minor.court_outcome = Some("Conviction - Fined".into());
        // Filtered out: not-applicable severity and an unwanted establishment type.
        let not_applicable = record(&id, 1, 10, "2019-01-02", Some("NA - Not Applicable"));
        let mut unwanted = record(&id, 2, 20, "2019-01-03", Some("C - Crucial"));
        unwanted.establishment_type = "Child Care - Food Preparation".into();
        let pass = record(&id, 3, 30, "2019-01-04", None);

        load_snapshots(
            &pool,
            &tables,
            &schema,
            vec![SnapshotRecords {
                snapshot: id,
                records: vec![significant, minor, not_applicable, unwanted, pass],
            }],
        )
        .await
        .unwrap();

        let pivots = pivot_columns(&pool, "inspections").await.unwrap();
        let names = pivots.iter().map(|p| p.name.as_str()).collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "num_null",
                "num_notice_to_comply",
                "num_ticket",
                "num_null_2",
                "num_conviction_fined",
            ]
        );

        let wanted = vec!["Restaurant".to_string()];
        let inspections = aggregate_inspections(&pool, "inspections", &wanted, &pivots)
            .await
            .unwrap();
        assert_eq!(inspections.len(), 2);

        let first = &inspections[0];
        assert_eq!(first.inspection_id, 10);
        assert_eq!(first.num_significant, 1);
        assert_eq!(first.num_minor, 1);
        assert_eq!(first.num_na, 0);
        assert_eq!(first.num_infractions, 2);
        let summary = first.infractions_summary.as_deref().unwrap();
        assert!(summary.contains("FAIL TO PROTECT FOOD"));
        assert!(summary.contains(". "));
        assert_eq!(first.pivot_counts["num_ticket"], 1);
        assert_eq!(first.pivot_counts["num_notice_to_comply"], 1);
        assert_eq!(first.pivot_counts["num_conviction_fined"], 1);
        assert_eq!(first.pivot_counts["num_null_2"], 1);

        let second = &inspections[1];
        assert_eq!(second.inspection_id, 30);
        assert_eq!(second.num_infractions, 0);
        assert_eq!(second.infractions_summary, None);
        assert_eq!(second.pivot_counts["num_null"], 1);

        let all_types = aggregate_inspections(&pool, "inspections", &[], &pivots)
            .await
            .unwrap();
        assert_eq!(all_types.len(), 3);
    }

    #[tokio::test]
    async fn pivots_count_action_outcome_combinations() {
        let pool = memory_pool().await;
        let tables = TableNames::default();
        let schema = TargetSchema::default();
        prepare_database(&pool, &tables, &schema).await.unwrap();

        let id = snapshot("20190116215713");
        let mut significant = record(&id, 1, 10, "2019-01-02", Some("S - Significant"));
        significant.infraction_details = Some("FAIL TO PROTECT FOOD".into());
        let mut minor = record(&id, 1, 10, "2019-01-02", Some("M - Minor"));
        minor.infraction_details = Some("FAIL TO CLEAN".into());

        load_snapshots(
            &pool,
            &tables,
            &schema,
            vec![SnapshotRecords {
                snapshot: id,
                records: vec![significant, minor],
            }],
        )
        .await
        .unwrap();

        let pivots = pivot_columns(&pool, "inspections").await.unwrap();
        let inspections = aggregate_inspections(&pool, "inspections", &[], &pivots)
            .await
            .unwrap();
        assert_eq!(inspections.len(), 1);
        let inspection = &inspections[0];
        assert_eq!(inspection.num_significant, 1);
        assert_eq!(inspection.num_minor, 1);
        assert_eq!(inspection.num_infractions, 2);
        assert_eq!(inspection.pivot_counts["num_notice_to_comply"], 1);
        assert_eq!(inspection.pivot_counts["num_null"], 1);
        let summary = inspection.infractions_summary.as_deref().unwrap();
        assert!(summary.contains("FAIL TO PROTECT FOOD"));
        assert!(summary.contains("FAIL TO CLEAN"));
    }
}
