use std::io::{self, Write};

use serde::Serialize;

use crate::app::{CheckResult, CloseResult, DiscardResult, PoolView, StatusReport, TransferResult};
use crate::report::SessionSummary;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_status(report: &StatusReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_check(result: &CheckResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_pool(view: &PoolView) -> io::Result<()> {
        Self::print_json(view)
    }

    pub fn print_transfer(result: &TransferResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_discard(result: &DiscardResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_summary(summary: &SessionSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_close(result: &CloseResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
