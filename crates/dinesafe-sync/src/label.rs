//! Class labels for downstream modelling.

use dinesafe_core::Inspection;
use serde::{Deserialize, Serialize};
use tracing::info;

/// An inspection is labelled positive when it found a significant or crucial infraction.
pub fn label_inspections(inspections: &mut [Inspection]) {
    for inspection in inspections.iter_mut() {
        inspection.is_infraction = Some(inspection.num_significant > 0 || inspection.num_crucial > 0);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelClass {
    pub label: bool,
    pub num_inspections: usize,
    pub fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelDistribution {
    pub label_column: String,
    pub total: usize,
    /// Most frequent class first.
    pub classes: Vec<LabelClass>,
}

impl LabelDistribution {
    pub fn from_inspections(label_column: &str, inspections: &[Inspection]) -> Self {
        let positive = inspections
            .iter()
            .filter(|i| i.is_infraction == Some(true))
            .count();
        let negative = inspections
            .iter()
            .filter(|i| i.is_infraction == Some(false))
            .count();
        let total = positive + negative;

        let mut classes = [(false, negative), (true, positive)]
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(label, count)| LabelClass {
                label,
                num_inspections: count,
                fraction: count as f64 / total as f64,
            })
            .collect::<Vec<_>>();
        classes.sort_by(|a, b| b.num_inspections.cmp(&a.num_inspections));

        let distribution = Self {
            label_column: label_column.to_string(),
            total,
            classes,
        };
        for class in &distribution.classes {
            info!(
                label = class.label,
                num_inspections = class.num_inspections,
                fraction = class.fraction,
                "label distribution"
            );
        }
        distribution
    }

    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            format!("| {} | fraction | num_inspections |", self.label_column),
            "|---|---|---|".to_string(),
        ];
        for class in &self.classes {
            lines.push(format!(
                "| {} | {:.4} | {} |",
                u8::from(class.label),
                class.fraction,
                class.num_inspections
            ));
        }
        lines.join("\n")
    }
}
