//! Host statistics for the server status endpoint, read from procfs.

use crate::Result;

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadAvg {
    pub load_1: f64,
    pub load_5: f64,
    pub load_15: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MemStats {
    pub total: u64,
    pub free: u64,
    pub cached: u64,
    pub used: u64,
}

pub fn read_loadavg() -> Result<LoadAvg> {
    parse_loadavg(&std::fs::read_to_string("/proc/loadavg")?)
}

pub fn read_meminfo() -> Result<MemStats> {
    parse_meminfo(&std::fs::read_to_string("/proc/meminfo")?)
}

fn parse_loadavg(content: &str) -> Result<LoadAvg> {
    let mut fields = content.split_whitespace();
    let mut next = || -> f64 {
        fields
            .next()
            .and_then(|f| f.parse().ok())
            .unwrap_or_default()
    };
    Ok(LoadAvg {
        load_1: next(),
        load_5: next(),
        load_15: next(),
    })
}

fn parse_meminfo(content: &str) -> Result<MemStats> {
    let mut stats = MemStats::default();
    let mut buffers = 0u64;
    for line in content.lines() {
        // Lines look like "MemTotal:       16384000 kB".
        let mut parts = line.split_whitespace();
        let Some(key) = parts.next() else { continue };
        let Some(value) = parts.next().and_then(|v| v.parse::<u64>().ok()) else {
            continue;
        };
        let bytes = value * 1024;
        match key {
            "MemTotal:" => stats.total = bytes,
            "MemFree:" => stats.free = bytes,
            "Cached:" => stats.cached = bytes,
            "Buffers:" => buffers = bytes,
            _ => {}
        }
    }
    stats.used = stats
        .total
        .saturating_sub(stats.free + stats.cached + buffers);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_loadavg() {
        let load = parse_loadavg("0.52 0.58 0.59 1/257 12345\n").unwrap();
        assert!((load.load_1 - 0.52).abs() < f64::EPSILON);
        assert!((load.load_5 - 0.58).abs() < f64::EPSILON);
        assert!((load.load_15 - 0.59).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_meminfo() {
        let content = "MemTotal:       16384000 kB\n\
MemFree:         4096000 kB\n\
MemAvailable:    8192000 kB\n\
Buffers:          512000 kB\n\
Cached:          2048000 kB\n";
        let stats = parse_meminfo(content).unwrap();
        assert_eq!(stats.total, 16_384_000 * 1024);
        assert_eq!(stats.free, 4_096_000 * 1024);
        assert_eq!(stats.cached, 2_048_000 * 1024);
        assert_eq!(stats.used, (16_384_000 - 4_096_000 - 2_048_000 - 512_000) * 1024);
    }
}
