use anyhow::{Context, Result};
use aya::maps::{MapData, PerCpuArray};
use kdebug_common::{COUNTER_DROPPED, COUNTER_FILTERED, COUNTER_FIRED};

use super::collector::DrainSummary;
use super::source::ProbeCounters;

/// Sum the per-CPU `COUNTERS` slots
///
/// # Errors
/// Returns an error if a counter slot cannot be read
pub fn read_probe_counters(counters: &PerCpuArray<MapData, u64>) -> Result<ProbeCounters> {
    let sum = |index: u32| -> Result<u64> {
        let values = counters
            .get(&index, 0)
            .with_context(|| format!("Failed to read counter slot {index}"))?;
        Ok(values.iter().sum())
    };
    Ok(ProbeCounters {
        fired: sum(COUNTER_FIRED)?,
        filtered: sum(COUNTER_FILTERED)?,
        dropped: sum(COUNTER_DROPPED)?,
    })
}

/// Print the event accounting of a finished recording
///
/// `fired = delivered + dropped + decode_errors` holds once the reader has
/// drained; a mismatch means events were still in flight at shutdown.
pub fn print_drain_diagnostics(summary: &DrainSummary) {
    println!("\n🔍 capture diagnostics:");
    println!("   - Probe fired (after filter): {}", summary.events_fired);
    println!("   - Filtered out: {}", summary.events_filtered);
    println!("   - Delivered to processor: {}", summary.frames_delivered);
    println!(
        "   - Dropped: {} (ring: {}, queue: {}, late: {})",
        summary.events_dropped, summary.ring_drops, summary.queue_drops, summary.late_drops
    );
    if summary.decode_errors > 0 {
        println!("   - Decode errors: {}", summary.decode_errors);
    }
    if !summary.is_balanced() {
        println!("   - Accounting mismatch: some events were in flight at shutdown");
    }
}
