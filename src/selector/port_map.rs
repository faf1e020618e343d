//! Static destination port range table for port-based selection

use std::net::IpAddr;

use crate::config::PortRangeConfig;

/// Inclusive port range bound to one exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
    pub exit: IpAddr,
}

impl PortRange {
    #[must_use]
    pub const fn new(start: u16, end: u16, exit: IpAddr) -> Self {
        Self { start, end, exit }
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }
}

impl From<&PortRangeConfig> for PortRange {
    fn from(config: &PortRangeConfig) -> Self {
        Self::new(config.start, config.end, config.exit)
    }
}

/// Port range table, sorted by range start
///
/// Ranges are assumed non-overlapping (checked by config validation); on
/// overlap the containing range with the highest start wins.
#[derive(Debug, Clone, Default)]
pub struct PortMap {
    ranges: Vec<PortRange>,
}

impl PortMap {
    #[must_use]
    pub fn new(mut ranges: Vec<PortRange>) -> Self {
        ranges.sort_by_key(|r| (r.start, r.end));
        Self { ranges }
    }

    #[must_use]
    pub fn from_config(ranges: &[PortRangeConfig]) -> Self {
        Self::new(ranges.iter().map(PortRange::from).collect())
    }

    /// Exit mapped to `port`, if any
    #[must_use]
    pub fn lookup(&self, port: u16) -> Option<IpAddr> {
        // Last range whose start is <= port
        let idx = self.ranges.partition_point(|r| r.start <= port);
        self.ranges[..idx]
            .iter()
            .rev()
            .find(|r| r.contains(port))
            .map(|r| r.exit)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_lookup() {
        let map = PortMap::new(vec![
            PortRange::new(8000, 8999, ip("10.0.0.3")),
            PortRange::new(1, 1023, ip("10.0.0.1")),
            PortRange::new(1024, 1024, ip("10.0.0.2")),
        ]);

        assert_eq!(map.lookup(1), Some(ip("10.0.0.1")));
        assert_eq!(map.lookup(443), Some(ip("10.0.0.1")));
        assert_eq!(map.lookup(1023), Some(ip("10.0.0.1")));
        assert_eq!(map.lookup(1024), Some(ip("10.0.0.2")));
        assert_eq!(map.lookup(1025), None);
        assert_eq!(map.lookup(8500), Some(ip("10.0.0.3")));
        assert_eq!(map.lookup(9000), None);
        assert_eq!(map.lookup(0), None);
    }

    #[test]
    fn test_empty_map() {
        let map = PortMap::default();
        assert!(map.is_empty());
        assert_eq!(map.lookup(80), None);
    }

    #[test]
    fn test_from_config() {
        let map = PortMap::from_config(&[PortRangeConfig {
            start: 80,
            end: 80,
            exit: ip("10.0.0.2"),
        }]);
        assert_eq!(map.len(), 1);
        assert_eq!(map.lookup(80), Some(ip("10.0.0.2")));
        assert_eq!(map.lookup(81), None);
    }
}
