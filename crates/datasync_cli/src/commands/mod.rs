//! CLI command implementations.

pub mod serve;
pub mod simulate;

use datasync_engine::MetricStats;

/// Prints stats as an aligned table.
pub fn print_stats_table(stats: &[MetricStats]) {
    println!(
        "{:<36} {:>8} {:>10} {:>10} {:>10} {:>10}",
        "metric", "records", "min", "mean", "max", "current"
    );
    for stat in stats {
        let unit = if stat.unit.is_empty() { "" } else { " ms" };
        println!(
            "{:<36} {:>8} {:>10.2} {:>10.2} {:>10.2} {:>10.2}{}",
            stat.name, stat.number_of_records, stat.min, stat.mean, stat.max, stat.current, unit
        );
    }
}
