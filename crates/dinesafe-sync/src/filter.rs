//! Removal of multi-day inspections and re-inspections.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;
use dinesafe_core::{EstablishmentKey, Inspection, InspectionKey};
use tracing::info;

/// Drop every inspection id that spans more than one date at its establishment, then
/// sort by establishment, inspection id and date.
pub fn remove_multi_day_inspections(inspections: Vec<Inspection>) -> Vec<Inspection> {
    let before = inspections.len();
    let mut dates: HashMap<InspectionKey, BTreeSet<NaiveDate>> = HashMap::new();
    for inspection in &inspections {
        dates
            .entry(inspection.inspection_key())
            .or_default()
            .insert(inspection.inspection_date);
    }

    let mut kept = inspections
        .into_iter()
        .filter(|i| {
            dates
                .get(&i.inspection_key())
                .map(|d| d.len() == 1)
                .unwrap_or(true)
        })
        .collect::<Vec<_>>();
    kept.sort_by(|a, b| {
        a.inspection_key()
            .cmp(&b.inspection_key())
            .then(a.inspection_date.cmp(&b.inspection_date))
    });

    info!(removed = before - kept.len(), kept = kept.len(), "removed multi-day inspections");
    kept
}

/// Drop inspections that follow the previous inspection of the same establishment
/// within `window_days`. Each kept inspection carries its gap to the previous one.
pub fn remove_reinspections(inspections: Vec<Inspection>, window_days: i64) -> Vec<Inspection> {
    let before = inspections.len();
    let mut by_establishment: BTreeMap<EstablishmentKey, Vec<Inspection>> = BTreeMap::new();
    for inspection in inspections {
        by_establishment
            .entry(inspection.establishment_key())
            .or_default()
            .push(inspection);
    }

    let mut kept = Vec::with_capacity(before);
    for (_, mut group) in by_establishment {
        group.sort_by(|a, b| {
            a.inspection_date
                .cmp(&b.inspection_date)
                .then(a.inspection_id.cmp(&b.inspection_id))
        });
        let mut previous: Option<NaiveDate> = None;
        for mut inspection in group {
            let gap = previous.map(|p| (inspection.inspection_date - p).num_days());
            previous = Some(inspection.inspection_date);
            inspection.days_since_previous = gap;
            match gap {
                Some(days) if days <= window_days => {}
                _ => kept.push(inspection),
            }
        }
    }

    info!(
        removed = before - kept.len(),
        kept = kept.len(),
        window_days,
        "removed re-inspections"
    );
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::inspection;

    #[test]
    fn multi_day_inspection_ids_are_dropped_entirely() {
        let kept = remove_multi_day_inspections(vec![
            inspection(2, 21, "2019-03-01"),
            inspection(1, 11, "2019-01-02"),
            inspection(1, 11, "2019-01-03"),
            inspection(1, 12, "2019-02-10"),
        ]);
        let ids = kept.iter().map(|i| i.inspection_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![12, 21]);
    }

    #[test]
    fn same_inspection_id_at_another_establishment_is_independent() {
        let mut elsewhere = inspection(1, 11, "2019-01-03");
        elsewhere.establishment_address = "1 OTHER ST".into();
        let kept = remove_multi_day_inspections(vec![inspection(1, 11, "2019-01-02"), elsewhere]);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn reinspections_within_window_are_removed() {
        let kept = remove_reinspections(
            vec![
                inspection(1, 13, "2019-01-12"),
                inspection(1, 11, "2019-01-01"),
                inspection(1, 12, "2019-01-03"),
                inspection(2, 21, "2019-01-02"),
            ],
            2,
        );
        let summary = kept
            .iter()
            .map(|i| (i.inspection_id, i.days_since_previous))
            .collect::<Vec<_>>();
        assert_eq!(summary, vec![(11, None), (13, Some(9)), (21, None)]);
    }

    #[test]
    fn same_day_inspections_keep_only_the_first() {
        let kept = remove_reinspections(
            vec![inspection(1, 12, "2019-01-01"), inspection(1, 11, "2019-01-01")],
            0,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].inspection_id, 11);
    }
}
