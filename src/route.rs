use std::collections::BTreeMap;

use crate::sample::Sample;

/// Samples for one resource, grouped by metric name in arrival order.
pub type MetricGroups = BTreeMap<String, Vec<Sample>>;

/// Group a batch by resource id, then metric name.
///
/// Samples sharing both keys keep their original relative order, so
/// measures land in the store in the order the caller submitted them.
pub fn group_by_resource(batch: Vec<Sample>) -> BTreeMap<String, MetricGroups> {
    let mut grouped: BTreeMap<String, MetricGroups> = BTreeMap::new();

    for sample in batch {
        grouped
            .entry(sample.resource_id.clone())
            .or_default()
            .entry(sample.counter_name.clone())
            .or_default()
            .push(sample);
    }

    grouped
}
