//! Styled terminal output for ruleguard
//!
//! Human-readable messages go through [`Output`] so quiet and verbose modes
//! behave the same in every command. Machine output (`--format json`, worker
//! envelopes) is printed directly and never styled.

use console::style;

use crate::rules::Severity;

/// Output handler for consistent CLI formatting
pub struct Output {
    verbose: bool,
    quiet: bool,
}

impl Output {
    pub fn new(verbose: bool, quiet: bool) -> Self {
        Self { verbose, quiet }
    }

    pub fn success(&self, message: &str) {
        if !self.quiet {
            println!("{} {}", style("✔").green(), message);
        }
    }

    /// Errors are always shown, even in quiet mode
    pub fn error(&self, message: &str) {
        eprintln!("{} {}", style("✖").red(), message);
    }

    pub fn warning(&self, message: &str) {
        if !self.quiet {
            println!("{} {}", style("⚠").yellow(), message);
        }
    }

    pub fn info(&self, message: &str) {
        if !self.quiet {
            println!("{} {}", style("ℹ").blue(), message);
        }
    }

    /// Only printed with `-v`
    pub fn verbose(&self, message: &str) {
        if self.verbose && !self.quiet {
            println!("{} {}", style("ℹ").dim(), style(message).dim());
        }
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    pub fn header(&self, title: &str) {
        if !self.quiet {
            println!("\n{}", style(title).bold().underlined());
        }
    }

    pub fn section_header(&self, title: &str) {
        if !self.quiet {
            println!("\n{}", style(title).bold().cyan());
        }
    }

    pub fn step(&self, step: &str) {
        if !self.quiet {
            println!("{} {}", style("❯").cyan(), step);
        }
    }

    pub fn table_row(&self, key: &str, value: &str) {
        if !self.quiet {
            println!("  {:<20} {}", style(key).dim(), value);
        }
    }

    pub fn list_item(&self, item: &str) {
        if !self.quiet {
            println!("  • {}", item);
        }
    }

    pub fn indent(&self, message: &str) {
        if !self.quiet {
            println!("    {}", message);
        }
    }

    pub fn blank_line(&self) {
        if !self.quiet {
            println!();
        }
    }

    pub fn key_value(&self, key: &str, value: &str, highlight: bool) {
        if !self.quiet {
            let styled_value = if highlight {
                style(value).green().bold()
            } else {
                style(value).white()
            };
            println!("  {} {}", style(key).dim(), styled_value);
        }
    }

    /// One line per rule outcome: pass/fail marker, severity, id, message
    pub fn rule_line(&self, passed: bool, severity: Severity, rule_id: &str, message: &str, note: &str) {
        if self.quiet && passed {
            return;
        }
        let marker = if passed {
            style("✓").green().bold()
        } else {
            style("✗").red().bold()
        };
        let severity = match severity {
            Severity::Critical | Severity::High => style(format!("{:<8}", severity.as_str())).red(),
            Severity::Medium => style(format!("{:<8}", severity.as_str())).yellow(),
            Severity::Low | Severity::Info => style(format!("{:<8}", severity.as_str())).dim(),
        };
        println!(
            "{} {} {:<28} {} {}",
            marker,
            severity,
            style(rule_id).bold(),
            message,
            style(note).dim()
        );
    }

    pub fn summary_stats(&self, label: &str, value: usize) {
        if !self.quiet {
            println!("  {} {}", style(label).dim(), style(value.to_string()).bold());
        }
    }
}
