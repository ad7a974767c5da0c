//! Hierarchical status reporting.
//!
//! Components emit lines into a [`StatusConsumer`]; nested components
//! write into a fork that is joined back, producing an indented report.

/// Collects an indented status report.
#[derive(Debug, Default)]
pub struct StatusConsumer {
    lines: Vec<(usize, String)>,
    depth: usize,
}

impl StatusConsumer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, line: impl Into<String>) {
        self.lines.push((self.depth, line.into()));
    }

    /// A child consumer one level deeper. Pass it to a nested component,
    /// then [`join`](Self::join) it back.
    #[must_use]
    pub fn fork(&self) -> StatusConsumer {
        StatusConsumer {
            lines: Vec::new(),
            depth: self.depth + 1,
        }
    }

    pub fn join(&mut self, child: StatusConsumer) {
        self.lines.extend(child.lines);
    }

    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (depth, line) in &self.lines {
            for _ in 0..*depth {
                out.push_str("  ");
            }
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

/// Anything that can describe itself into a status report.
pub trait Status {
    fn status(&self, sc: &mut StatusConsumer);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forked_lines_indent_under_their_parent() {
        let mut sc = StatusConsumer::new();
        sc.emit("top");
        let mut child = sc.fork();
        child.emit("nested");
        sc.join(child);
        sc.emit("after");
        assert_eq!(sc.render(), "top\n  nested\nafter\n");
    }
}
