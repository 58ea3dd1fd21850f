use std::collections::HashMap;

/// Parsed `INFO` reply: field name to raw value.
pub type InfoMap = HashMap<String, String>;

/// Parses the text of an `INFO` reply.
///
/// Section headers (`# Memory`) and blank lines are skipped; each remaining
/// line is split at its first `:`.
pub fn parse_info(text: &str) -> InfoMap {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Reads a numeric field, ignoring unparsable values.
pub fn info_number(info: &InfoMap, field: &str) -> Option<f64> {
    info.get(field)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMORY: &str = "# Memory\r\nused_memory:1024\r\nused_memory_human:1.00K\r\nmaxmemory:0\r\nmem_fragmentation_ratio:1.23\r\n\r\n";

    #[test]
    fn test_parse_info_skips_headers() {
        let info = parse_info(MEMORY);
        assert_eq!(info.len(), 4);
        assert_eq!(info.get("used_memory").map(String::as_str), Some("1024"));
        assert_eq!(info.get("used_memory_human").map(String::as_str), Some("1.00K"));
    }

    #[test]
    fn test_values_may_contain_colons() {
        let info = parse_info("executable:/usr/bin/redis-server\nconfig_file:c:/redis.conf");
        assert_eq!(
            info.get("config_file").map(String::as_str),
            Some("c:/redis.conf")
        );
    }

    #[test]
    fn test_info_number() {
        let info = parse_info(MEMORY);
        assert_eq!(info_number(&info, "used_memory"), Some(1024.0));
        assert_eq!(info_number(&info, "mem_fragmentation_ratio"), Some(1.23));
        assert_eq!(info_number(&info, "used_memory_human"), None);
        assert_eq!(info_number(&info, "missing"), None);
    }
}
