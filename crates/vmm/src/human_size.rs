use core::fmt;

/// A byte count that displays with a binary unit, e.g. `48KiB` or `1.5MiB`.
///
/// At most two decimals are shown, truncated rather than rounded, and trailing zeros are
/// dropped. Only integer arithmetic is used, so it can be logged before the FPU is set up.
///
/// ```
/// use vmm::HumanSize;
///
/// assert_eq!(HumanSize(48 * 1024).to_string(), "48KiB");
/// assert_eq!(HumanSize(3 << 19).to_string(), "1.5MiB");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HumanSize(pub usize);

const UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0 as u128;
        let unit = (1..UNITS.len())
            .take_while(|u| bytes >> (10 * u) != 0)
            .last()
            .unwrap_or(0);
        let shift = 10 * unit;
        let whole = bytes >> shift;
        let cents = ((bytes - (whole << shift)) * 100) >> shift;

        write!(f, "{}", whole)?;
        if cents % 10 != 0 {
            write!(f, ".{:02}", cents)?;
        } else if cents != 0 {
            write!(f, ".{}", cents / 10)?;
        }
        f.write_str(UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn show(bytes: usize) -> String {
        HumanSize(bytes).to_string()
    }

    #[test]
    fn small_values_stay_in_bytes() {
        assert_eq!(show(0), "0B");
        assert_eq!(show(1023), "1023B");
    }

    #[test]
    fn picks_the_largest_whole_unit() {
        assert_eq!(show(4096), "4KiB");
        assert_eq!(show(48 * 1024), "48KiB");
        assert_eq!(show(12 << 20), "12MiB");
        assert_eq!(show(3 << 29), "1.5GiB");
    }

    #[test]
    fn truncates_to_two_decimals() {
        assert_eq!(show(1280), "1.25KiB");
        assert_eq!(show(1025), "1KiB");
        assert_eq!(show(1044), "1.01KiB");
    }
}
