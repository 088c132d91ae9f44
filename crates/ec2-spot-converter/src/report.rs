//! Terminal progress reporter

use colored::Colorize;
use spot_converter_core::Reporter;

/// Colour reporter for interactive runs
#[derive(Debug, Default)]
pub struct TerminalReporter;

impl TerminalReporter {
    pub fn new() -> Self {
        Self
    }
}

impl Reporter for TerminalReporter {
    fn step_started(&self, index: usize, total: usize, description: &str) {
        println!("{} {description}", format!("[STEP {index}/{total}]").bold());
    }

    fn step_replayed(&self, index: usize, total: usize, description: &str, detail: Option<&str>) {
        println!(
            "{} {description} {}",
            format!("[STEP {index}/{total}]").bold(),
            ": RECOVERED STATE. SKIPPED!".dimmed()
        );
        if let Some(detail) = detail {
            println!("  {} {detail}", "=> SUCCESS.".green().dimmed());
        }
    }

    fn step_succeeded(&self, detail: &str) {
        println!("  {} {detail}", "=> SUCCESS.".green().bold());
    }

    fn step_skipped(&self, detail: &str) {
        println!("  {} {detail}", "=> SKIPPED!".yellow().bold());
    }

    fn note(&self, message: &str) {
        println!("{message}");
    }

    fn warning(&self, message: &str) {
        eprintln!("{} {message}", "/!\\ WARNING /!\\".red().bold());
    }

    fn major_warning(&self, message: &str) {
        eprintln!("{} {message}", "/!\\ WARNING /!\\".red().bold().underline());
    }
}
