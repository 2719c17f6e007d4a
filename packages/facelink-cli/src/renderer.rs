use facelink::{RenderSnapshot, Renderer};
use tracing::info;

/// Logs the render summary whenever its content changes
///
/// The frame-rate line is ignored when comparing, otherwise every rate update
/// would produce a new log entry.
pub struct LogRenderer {
    match_threshold: f64,
    quiet: bool,
    last: Vec<String>,
}

impl LogRenderer {
    pub fn new(match_threshold: f64, quiet: bool) -> Self {
        Self {
            match_threshold,
            quiet,
            last: Vec::new(),
        }
    }

    /// Returns true when the summary differs from the previous one
    fn update(&mut self, snapshot: &RenderSnapshot) -> bool {
        let lines = snapshot.summary_lines(self.match_threshold);
        let changed = lines.get(1..) != self.last.get(1..);
        self.last = lines;
        changed
    }
}

impl Renderer for LogRenderer {
    fn render(&mut self, snapshot: &RenderSnapshot) {
        if self.update(snapshot) && !self.quiet {
            for line in &self.last {
                info!("{}", line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_rate_alone_is_not_a_change() {
        let mut renderer = LogRenderer::new(0.8, true);
        let mut snapshot = RenderSnapshot::default();
        assert!(renderer.update(&snapshot));

        snapshot.frame_rate = 120;
        assert!(!renderer.update(&snapshot));

        snapshot.stage1_error = Some("Network error: refused".to_string());
        assert!(renderer.update(&snapshot));
    }
}
