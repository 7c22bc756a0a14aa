use crate::span::Span;

/// A lowering error.
///
/// Every precondition violation in the lowering pipeline surfaces as an
/// `Err(Diagnostic)`; callers abort the compilation unit on the first one.
/// Diagnostics raised while reading a text model carry the offending
/// line's span, everything else uses `Span::dummy()`.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub message: String,
    pub span: Span,
    pub notes: Vec<String>,
    pub help: Option<String>,
}

impl Diagnostic {
    pub fn error(message: String, span: Span) -> Self {
        Self {
            message,
            span,
            notes: Vec::new(),
            help: None,
        }
    }

    /// Shorthand for an error with no source location.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::error(message.into(), Span::dummy())
    }

    pub fn with_note(mut self, note: String) -> Self {
        self.notes.push(note);
        self
    }

    pub fn with_help(mut self, help: String) -> Self {
        self.help = Some(help);
        self
    }

    /// Render to stderr with ariadne; the label is only drawn when the
    /// span points into `source`.
    pub fn render(&self, filename: &str, source: &str) {
        use ariadne::{Color, Label, Report, ReportKind, Source};

        let start = (self.span.start as usize).min(source.len());
        let end = (self.span.end as usize).clamp(start, source.len());

        let mut report =
            Report::build(ReportKind::Error, filename, start).with_message(&self.message);
        if !self.span.is_dummy() && end > start {
            report = report.with_label(
                Label::new((filename, start..end))
                    .with_message(&self.message)
                    .with_color(Color::Red),
            );
        }
        for note in &self.notes {
            report = report.with_note(note);
        }
        if let Some(help) = &self.help {
            report = report.with_help(help);
        }

        if let Err(e) = report
            .finish()
            .eprint((filename, Source::from(source)))
        {
            eprintln!("{} ({})", self, e);
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error: {}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let span = Span::new(10, 15);
        let d = Diagnostic::error("tile size mismatch".to_string(), span);
        assert_eq!(d.message, "tile size mismatch");
        assert_eq!(d.span, span);
        assert!(d.notes.is_empty());
        assert!(d.help.is_none());
    }

    #[test]
    fn test_fatal_has_no_span() {
        let d = Diagnostic::fatal("no cache entry");
        assert!(d.span.is_dummy());
        assert_eq!(d.to_string(), "error: no cache entry");
    }

    #[test]
    fn test_chained_builders() {
        let d = Diagnostic::fatal("cache directive 3 cannot be lowered")
            .with_note("note 1".to_string())
            .with_help("use 'gpu_array'".to_string())
            .with_note("note 2".to_string());
        assert_eq!(d.notes, vec!["note 1", "note 2"]);
        assert_eq!(d.help.as_deref(), Some("use 'gpu_array'"));
    }

    #[test]
    fn test_render_with_and_without_source() {
        let source = "tree 2 1 0 3\nnode 0.5 7 -1 1 2 numerical\n";
        Diagnostic::error("feature index out of range".to_string(), Span::new(13, 40))
            .with_note("tree has 2 features".to_string())
            .render("model.forest", source);
        Diagnostic::fatal("missing loop step").render("<lowering>", "");
    }
}
