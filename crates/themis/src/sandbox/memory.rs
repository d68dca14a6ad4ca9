//! Peak memory sampling from procfs
//!
//! A program may fork, so memory is accounted over its whole process group.
//! The keeper and init of a jailed run are forks of the judge and are left
//! out of the sum.

/// Memory high-water marks, in KB
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MemorySample {
    /// Peak resident set size
    pub resident_peak_kb: u64,
    /// VmPeak: peak virtual size of the largest process
    pub virtual_peak_kb: u64,
}

impl MemorySample {
    pub fn max(self, other: Self) -> Self {
        Self {
            resident_peak_kb: self.resident_peak_kb.max(other.resident_peak_kb),
            virtual_peak_kb: self.virtual_peak_kb.max(other.virtual_peak_kb),
        }
    }
}

/// Memory lines of one `/proc/<pid>/status`, in KB
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProcessMemory {
    /// VmRSS
    pub resident_kb: u64,
    /// VmHWM
    pub resident_peak_kb: u64,
    /// VmPeak
    pub virtual_peak_kb: u64,
}

/// Sample every process in group `pgid`.
///
/// With `supervisor` set, that process and its direct children are skipped.
/// The resident figure is the larger of the group's current total and the
/// largest single high-water mark.
pub(crate) fn sample_group(pgid: u32, supervisor: Option<u32>) -> MemorySample {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return MemorySample::default();
    };

    let mut resident_total = 0;
    let mut sample = MemorySample::default();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        // procfs reads never touch a disk
        let Some((ppid, pgrp)) = std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| parse_stat(&stat))
        else {
            continue;
        };
        if pgrp != pgid || supervisor.is_some_and(|keeper| pid == keeper || ppid == keeper) {
            continue;
        }
        let Ok(status) = std::fs::read_to_string(format!("/proc/{pid}/status")) else {
            continue;
        };

        let memory = parse_status(&status);
        resident_total += memory.resident_kb;
        sample = sample.max(MemorySample {
            resident_peak_kb: memory.resident_peak_kb,
            virtual_peak_kb: memory.virtual_peak_kb,
        });
    }

    sample.resident_peak_kb = sample.resident_peak_kb.max(resident_total);
    sample
}

/// Parent pid and process group from a procfs stat line.
pub(crate) fn parse_stat(stat: &str) -> Option<(u32, u32)> {
    // The command name may itself contain spaces and parentheses
    let (_, rest) = stat.rsplit_once(')')?;
    let mut fields = rest.split_whitespace().skip(1);
    let ppid = fields.next()?.parse().ok()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some((ppid, pgrp))
}

/// Extract the memory lines from a procfs status file.
pub(crate) fn parse_status(status: &str) -> ProcessMemory {
    let mut memory = ProcessMemory::default();
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            memory.resident_kb = parse_kb(rest);
        } else if let Some(rest) = line.strip_prefix("VmHWM:") {
            memory.resident_peak_kb = parse_kb(rest);
        } else if let Some(rest) = line.strip_prefix("VmPeak:") {
            memory.virtual_peak_kb = parse_kb(rest);
        }
    }
    memory
}

fn parse_kb(field: &str) -> u64 {
    field
        .split_whitespace()
        .next()
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        let status = "Name:\tsolution\nVmPeak:\t  10240 kB\nVmSize:\t  10000 kB\nVmHWM:\t    2048 kB\nVmRSS:\t    1900 kB\n";
        let memory = parse_status(status);
        assert_eq!(memory.resident_peak_kb, 2048);
        assert_eq!(memory.resident_kb, 1900);
        assert_eq!(memory.virtual_peak_kb, 10240);
    }

    #[test]
    fn test_zombie_has_no_memory_lines() {
        let memory = parse_status("Name:\tsolution\nState:\tZ (zombie)\n");
        assert_eq!(memory, ProcessMemory::default());
    }

    #[test]
    fn test_parse_stat_with_awkward_command_name() {
        let stat = "4242 (a) b (c) S 4200 4100 4100 0 -1 4194560 120 0 0 0";
        assert_eq!(parse_stat(stat), Some((4200, 4100)));
        assert_eq!(parse_stat("garbage"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_sample_own_group() {
        let pgid = nix::unistd::getpgrp().as_raw() as u32;
        let sample = sample_group(pgid, None);
        assert!(sample.resident_peak_kb > 0);

        assert_eq!(sample_group(u32::MAX, None), MemorySample::default());
    }
}
