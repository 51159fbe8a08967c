/// Replacement for copy-tool lines that mention a timeout.
pub const TIMEOUT_NOTICE: &str = "Network connection timed out, trying another route";

/// Highest percentage output lines alone can reach. Only a successful exit
/// of the copy tool completes a pull.
pub const LINE_CEILING: u8 = 99;

/// Turns copy-tool output into a coarse percentage.
///
/// The percentage never decreases within one attempt; a fresh tracker is used
/// for every strategy attempt.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    percent: u8,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one output line, returning the current percentage and the line to
    /// forward to the client.
    pub fn observe(&mut self, line: &str) -> (u8, String) {
        let lower = line.to_ascii_lowercase();

        if lower.contains("signatures") {
            self.advance(10);
        } else if lower.contains("copying blob") {
            self.advance(self.percent.saturating_add(2).min(80));
        } else if lower.contains("copying config") {
            self.advance(80);
        } else if lower.contains("writing manifest") {
            self.advance(LINE_CEILING);
        }

        let forwarded = if lower.contains("timeout") {
            TIMEOUT_NOTICE.to_string()
        } else {
            line.to_string()
        };
        (self.percent, forwarded)
    }

    fn advance(&mut self, to: u8) {
        self.percent = self.percent.max(to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typical_copy_output() {
        let lines = [
            "Getting image source signatures",
            "Copying blob sha256:aaa",
            "Copying blob sha256:bbb",
            "Copying blob sha256:ccc",
            "Copying config sha256:ddd",
            "Writing manifest to image destination",
        ];
        let mut tracker = ProgressTracker::new();
        let seen: Vec<u8> = lines.iter().map(|l| tracker.observe(l).0).collect();
        assert_eq!(seen, vec![10, 12, 14, 16, 80, 99]);
    }

    #[test]
    fn blobs_cap_at_eighty_and_never_regress() {
        let mut tracker = ProgressTracker::new();
        tracker.observe("Getting image source signatures");
        let mut last = 0;
        for _ in 0..100 {
            let (p, _) = tracker.observe("Copying blob sha256:x");
            assert!(p >= last);
            last = p;
        }
        assert_eq!(last, 80);
        // a late signatures line must not move the bar backwards
        assert_eq!(tracker.observe("Getting image source signatures").0, 80);
    }

    #[test]
    fn timeout_lines_are_rewritten_and_others_forwarded() {
        let mut tracker = ProgressTracker::new();
        let (p, line) = tracker.observe("dial tcp: i/o timeout");
        assert_eq!(p, 0);
        assert_eq!(line, TIMEOUT_NOTICE);

        let (_, line) = tracker.observe("some unrelated line");
        assert_eq!(line, "some unrelated line");
    }
}
