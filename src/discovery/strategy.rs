//! Remote enumeration strategies and output parsing

use std::collections::BTreeSet;

/// A shell pipeline that prints one listening port per line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strategy {
    pub name: &'static str,
    pub command: &'static str,
}

/// Tried in this order; the first with non-empty output wins
pub const STRATEGIES: [Strategy; 3] = [
    Strategy {
        name: "netstat",
        command: "netstat -tlnp 2>/dev/null | grep LISTEN | awk '{print $4}' | cut -d: -f2 | sort -n | uniq",
    },
    Strategy {
        name: "ss",
        command: "ss -tlnp 2>/dev/null | grep LISTEN | awk '{print $4}' | cut -d: -f2 | sort -n | uniq",
    },
    Strategy {
        name: "lsof",
        command: "lsof -i -P -n 2>/dev/null | grep LISTEN | awk '{print $9}' | cut -d: -f2 | sort -n | uniq",
    },
];

/// Parse strategy output into ascending, distinct ports in 1..=65535.
/// Blank, non-numeric and out-of-range lines are dropped.
pub fn parse_port_lines(output: &str) -> Vec<u16> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.parse::<u32>().ok())
        .filter(|port| (1..=65535).contains(port))
        .filter_map(|port| u16::try_from(port).ok())
        .collect::<BTreeSet<u16>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dedupes_and_sorts() {
        let output = "8080\n22\n 443 \n\n8080\n22\n";
        assert_eq!(parse_port_lines(output), vec![22, 443, 8080]);
    }

    #[test]
    fn test_parse_drops_garbage_and_out_of_range() {
        let output = "0\n65535\n65536\n-1\n*\n::\nabc\n3000\n99999999999\n";
        assert_eq!(parse_port_lines(output), vec![3000, 65535]);
    }

    #[test]
    fn test_parse_garbage_only_is_empty() {
        assert!(parse_port_lines("Active\nProto\n").is_empty());
    }

    #[test]
    fn test_strategy_order() {
        let names: Vec<&str> = STRATEGIES.iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["netstat", "ss", "lsof"]);
    }
}
