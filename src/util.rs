/*!
util.rs - Small option-string helpers shared by the core.

Option and log flags arrive as comma-separated strings
(e.g. `"video:border-chars=3,video:interlace-wobble"`). Peripherals probe
them at construction time; nothing re-parses flags on a hot path.
*/

/// Return true if `flags` contains `name` as a comma-separated entry.
///
/// A trailing `=value` on an entry does not make it match a bare name, so
/// `has_option("video:border-chars=3", "video:border-chars")` is false while
/// `get_u32_option` picks it up instead.
pub fn has_option(flags: &str, name: &str) -> bool {
    flags.split(',').any(|f| f.trim() == name)
}

/// Find `prefix` (ending in `=`) in `flags` and parse the value after it.
/// Returns `None` if absent or unparseable.
pub fn get_u32_option(flags: &str, prefix: &str) -> Option<u32> {
    debug_assert!(prefix.ends_with('='));
    flags
        .split(',')
        .map(str::trim)
        .find_map(|f| f.strip_prefix(prefix))
        .and_then(|v| v.parse::<u32>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_flags() {
        assert!(has_option("fasttape,serial:state", "fasttape"));
        assert!(has_option("fasttape, serial:state", "serial:state"));
        assert!(!has_option("fasttape", "serial:state"));
        assert!(!has_option("", "fasttape"));
    }

    #[test]
    fn valued_flags() {
        assert_eq!(
            get_u32_option("video:border-chars=3", "video:border-chars="),
            Some(3)
        );
        assert_eq!(
            get_u32_option("a,video:border-chars=16,b", "video:border-chars="),
            Some(16)
        );
        assert_eq!(get_u32_option("a,b", "video:border-chars="), None);
        assert_eq!(
            get_u32_option("video:border-chars=zz", "video:border-chars="),
            None
        );
    }

    #[test]
    fn valued_flag_is_not_a_bare_match() {
        assert!(!has_option("video:border-chars=3", "video:border-chars"));
    }
}
