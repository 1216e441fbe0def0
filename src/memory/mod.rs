//! Mapped-image consistency engine (engine 4): per-process address-space
//! walk and the parallel all-process driver.

pub mod consistency;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::errors::Result;
use crate::platform::ProcessMemory;
use crate::report::ReportKind;
use crate::scan::ScanContext;

use self::consistency::{ConsistencyReport, MapConsistency, check_mapped_consistency};

/// Upper bound of the user-mode address space walk.
const USER_SPACE_END: u64 = 1 << 48;

/// Walk one process's address space and check every image mapping.
///
/// The walk opens a candidate span when the allocation base changes onto
/// an image-typed region and closes it (submitting the full span to the
/// consistency check) when the allocation base changes again. A failed
/// query ends the walk; an open trailing span is abandoned with it.
pub fn check_process_memory_consistency(process: &dyn ProcessMemory) -> Vec<ConsistencyReport> {
    let mut reports = Vec::new();
    let mut cursor = 0u64;
    let mut open_region: Option<u64> = None;

    while cursor < USER_SPACE_END {
        let Some(region) = process.query_region(cursor) else {
            return reports;
        };
        if region.size == 0 {
            return reports;
        }

        if let Some(open_base) = open_region
            && region.allocation_base != open_base
        {
            let span = region.base - open_base;
            reports.push(check_mapped_consistency(process, open_base, span));
            open_region = None;
        }

        if open_region != Some(region.allocation_base) && region.is_image {
            open_region = Some(region.allocation_base);
        }

        cursor = region.base + region.size;
    }

    reports
}

/// Check every accessible process in parallel and write the grouped
/// consistency report. Returns the number of non-consistent mappings.
pub fn run_consistency_checks(ctx: &ScanContext) -> Result<usize> {
    eprintln!("[DG-MEM] checking memory consistency");

    let mut promises = Vec::new();
    for pid in ctx.sources.processes.processes() {
        let processes = Arc::clone(&ctx.sources.processes);
        promises.push((
            pid,
            ctx.pool.submit_promise(move || match processes.open(pid) {
                Ok(process) => check_process_memory_consistency(process.as_ref()),
                Err(_) => {
                    let image = processes.image_name(pid);
                    match image {
                        Some(image) => eprintln!("[DG-MEM] unable to open PID {pid} ({image})"),
                        None => eprintln!("[DG-MEM] unable to open PID {pid}"),
                    }
                    Vec::new()
                }
            }),
        ));
    }

    let mut results = Vec::new();
    for (pid, promise) in promises {
        match promise.wait() {
            Ok(mut reports) => results.append(&mut reports),
            Err(err) => eprintln!("[DG-MEM] consistency task for PID {pid} failed: {err}"),
        }
    }

    Ok(write_consistency_report(ctx, &results))
}

/// Group the non-consistent results per (image, verdict, comment) line and
/// emit each group with its affected mappings.
fn write_consistency_report(ctx: &ScanContext, results: &[ConsistencyReport]) -> usize {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut flagged = 0usize;

    for result in results {
        if result.consistency == MapConsistency::Consistent {
            continue;
        }
        flagged += 1;

        let image = result
            .image
            .clone()
            .unwrap_or_else(|| "Unknown Doppelgang".to_string());
        let mut header = format!("{image}: {}", result.consistency.label());
        if let Some(comment) = &result.comment {
            header.push_str(&format!(" - {comment}"));
        }

        let end = result.base + result.size;
        let mapping = match ctx.sources.processes.image_name(result.pid) {
            Some(process_image) => format!(
                "PID {} ({process_image}) at {:#x} : {end:#x}",
                result.pid, result.base
            ),
            None => format!("PID {} at {:#x} : {end:#x}", result.pid, result.base),
        };
        grouped.entry(header).or_default().push(mapping);
    }

    let report = ctx.reports.stream(ReportKind::InconsistentImages);
    for (header, mappings) in grouped {
        report.group(&header, mappings);
    }
    flagged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::RegionInfo;
    use crate::testutil::FakeProcess;

    fn image_region(base: u64, alloc: u64, size: u64, protect: u32) -> RegionInfo {
        RegionInfo {
            base,
            allocation_base: alloc,
            size,
            protect,
            is_image: true,
        }
    }

    fn private_region(base: u64, size: u64) -> RegionInfo {
        RegionInfo {
            base,
            allocation_base: base,
            size,
            protect: 0x04,
            is_image: false,
        }
    }

    #[test]
    fn walk_submits_full_image_spans() {
        // Image allocation at 0x10000 spanning two regions, followed by a
        // private allocation that closes it.
        let process = FakeProcess::builder(77)
            .region(image_region(0x10000, 0x10000, 0x1000, 0x02))
            .region(image_region(0x11000, 0x10000, 0x2000, 0x20))
            .region(private_region(0x13000, 0x1000))
            .build();

        let reports = check_process_memory_consistency(&process);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].base, 0x10000);
        assert_eq!(reports[0].size, 0x3000);
        assert_eq!(reports[0].pid, 77);
    }

    #[test]
    fn walk_without_images_reports_nothing() {
        let process = FakeProcess::builder(1)
            .region(private_region(0x1000, 0x4000))
            .build();
        assert!(check_process_memory_consistency(&process).is_empty());
    }

    #[test]
    fn trailing_open_span_is_abandoned_with_the_walk() {
        // The walk ends (query failure) while an image span is open; the
        // span is not submitted, matching the walk contract.
        let process = FakeProcess::builder(2)
            .region(image_region(0x10000, 0x10000, 0x1000, 0x02))
            .build();
        assert!(check_process_memory_consistency(&process).is_empty());
    }

    #[test]
    fn adjacent_image_allocations_are_split() {
        let process = FakeProcess::builder(3)
            .region(image_region(0x10000, 0x10000, 0x2000, 0x02))
            .region(image_region(0x20000, 0x20000, 0x1000, 0x02))
            .region(private_region(0x30000, 0x1000))
            .build();

        let reports = check_process_memory_consistency(&process);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].base, 0x10000);
        // The free gap after the allocation closes the span at its base.
        assert_eq!(reports[0].size, 0x2000);
        assert_eq!(reports[1].base, 0x20000);
    }
}
