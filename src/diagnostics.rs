use regex::RegexSet;

/// Default failure markers: a colcon package-build failure and a generic error tag.
pub const DEFAULT_MARKERS: &[&str] = &[r"Failed\s+<<<", r"ERROR:"];
pub const DEFAULT_CONTEXT_RADIUS: usize = 20;
pub const DEFAULT_MAX_LINE_LEN: usize = 300;
const ELLIPSIS: &str = "...";

/// Excerpt of execution output framed around the first failure marker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiagnosticContext {
    pub matched: bool,
    /// Index of the marker line in the full output.
    pub marker_line: Option<usize>,
    pub lines: Vec<String>,
}

impl DiagnosticContext {
    pub fn render(&self) -> String {
        self.lines.join("\n")
    }
}

/// Scans execution output for compiler and build failure signatures.
#[derive(Debug, Clone)]
pub struct DiagnosticExtractor {
    markers: RegexSet,
    radius: usize,
    max_line_len: usize,
}

impl Default for DiagnosticExtractor {
    fn default() -> Self {
        Self {
            markers: RegexSet::new(DEFAULT_MARKERS).expect("default markers are valid"),
            radius: DEFAULT_CONTEXT_RADIUS,
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

impl DiagnosticExtractor {
    pub fn new<I, S>(markers: I, radius: usize, max_line_len: usize) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            markers: RegexSet::new(markers)?,
            radius,
            max_line_len,
        })
    }

    /// Returns the context window around the first marker line, or an empty,
    /// unmatched context when no marker appears.
    ///
    /// The window holds `min(len, 2 * radius + 1)` contiguous lines and always
    /// contains the marker line; near either end of the output it slides
    /// inward rather than shrinking.
    pub fn extract(&self, output: &str) -> DiagnosticContext {
        let lines: Vec<&str> = output.lines().collect();
        let Some(hit) = lines.iter().position(|l| self.markers.is_match(l)) else {
            return DiagnosticContext::default();
        };

        let width = self
            .radius
            .saturating_mul(2)
            .saturating_add(1)
            .min(lines.len());
        let start = hit
            .saturating_sub(self.radius)
            .min(lines.len() - width);
        let window = lines[start..start + width]
            .iter()
            .map(|l| truncate_line(l, self.max_line_len))
            .collect();

        DiagnosticContext {
            matched: true,
            marker_line: Some(hit),
            lines: window,
        }
    }
}

/// Cuts a line to `max` characters and appends an ellipsis when it was longer.
pub fn truncate_line(line: &str, max: usize) -> String {
    match line.char_indices().nth(max) {
        Some((cut, _)) => format!("{}{}", &line[..cut], ELLIPSIS),
        None => line.to_string(),
    }
}
