use std::sync::Arc;

use types::{Batch, MeasurementCategory, MeasurementDefinition, Slice};

/// Pure, deterministic grouping of measurement definitions into
/// contiguous-address batches per category.
pub struct BatchPlanner;

impl BatchPlanner {
    /// Partitions `definitions` by category, sorts each partition by
    /// ascending address, and greedily merges definitions whose address
    /// equals the running batch's `end_exclusive` into the same batch. A
    /// gap (or would-be overlap) starts a new batch.
    pub fn plan(definitions: &[MeasurementDefinition]) -> Vec<Batch> {
        let mut by_category: Vec<(MeasurementCategory, Vec<&MeasurementDefinition>)> = Vec::new();
        for category in [
            MeasurementCategory::Coil,
            MeasurementCategory::DiscreteInput,
            MeasurementCategory::HoldingRegister,
            MeasurementCategory::InputRegister,
        ] {
            let mut group: Vec<&MeasurementDefinition> =
                definitions.iter().filter(|d| d.category == category).collect();
            if group.is_empty() {
                continue;
            }
            group.sort_by_key(|d| d.address);
            by_category.push((category, group));
        }

        let mut batches = Vec::new();
        for (category, group) in by_category {
            batches.extend(Self::plan_category(category, &group));
        }
        batches
    }

    fn plan_category(category: MeasurementCategory, sorted: &[&MeasurementDefinition]) -> Vec<Batch> {
        let mut batches: Vec<Batch> = Vec::new();

        for definition in sorted {
            let starts_new_batch = match batches.last() {
                Some(batch) => u32::from(definition.address) != batch.end_exclusive(),
                None => true,
            };

            if starts_new_batch {
                batches.push(Batch {
                    category,
                    start_address: definition.address,
                    count: definition.count,
                    slices: vec![Slice { definition: Arc::new((*definition).clone()), offset: 0 }],
                });
            } else {
                let batch = batches.last_mut().expect("checked above");
                let offset = definition.address - batch.start_address;
                batch.count += definition.count;
                batch.slices.push(Slice { definition: Arc::new((*definition).clone()), offset });
            }
        }

        batches
    }
}
