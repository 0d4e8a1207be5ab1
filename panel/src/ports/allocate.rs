//! Contiguous free-run search

use std::collections::HashSet;

use crate::errors::PanelError;

/// First run of `count` consecutive ports in `start..=end` with none in `used`
pub fn find_contiguous(used: &HashSet<u16>, start: u16, end: u16, count: usize) -> Option<Vec<u16>> {
    if count == 0 {
        return Some(Vec::new());
    }

    let mut run_start = start;
    let mut run_len = 0usize;
    for port in start..=end {
        if used.contains(&port) {
            run_len = 0;
            continue;
        }
        if run_len == 0 {
            run_start = port;
        }
        run_len += 1;
        if run_len == count {
            return Some((run_start..=port).collect());
        }
    }
    None
}

/// Find one run per entry of `counts`, marking each run used before looking
/// for the next so that no two runs overlap
pub fn plan_segments(
    used: &mut HashSet<u16>,
    start: u16,
    end: u16,
    counts: &[usize],
) -> Result<Vec<Vec<u16>>, PanelError> {
    let mut segments = Vec::with_capacity(counts.len());
    for &count in counts {
        let run = find_contiguous(used, start, end, count).ok_or_else(|| {
            PanelError::Conflict(format!(
                "no {} contiguous free port(s) in {}-{}",
                count, start, end
            ))
        })?;
        used.extend(run.iter().copied());
        segments.push(run);
    }
    Ok(segments)
}
