//! Test report assembly and export.
//!
//! A `TestReport` collects one `ReportSection` per sweep. Each section records
//! which devices took part, the sweep parameters, result tables and the plots
//! an external tool should draw from those tables. Reports export to:
//!
//! - Markdown (`report.md`) with tables rounded to two decimals and decimated
//!   to at most [`MAX_TABLE_ROWS`] rows
//! - JSON (`report.json`) carrying the full-resolution data
//! - CSV and Arrow IPC, one file of each per table

use arrow::array::{ArrayRef, Float64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::error::{AppResult, HarnessError};

/// Rows shown per table in the rendered report
pub const MAX_TABLE_ROWS: usize = 20;

/// Round to `places` decimal places.
pub fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

/// Thin `values` down to roughly `size` entries.
///
/// The first and last values are always kept; in between every
/// `ceil(len / size)`-th value is taken. Shorter inputs are returned as is.
pub fn decimate(values: &[f64], size: usize) -> Vec<f64> {
    if values.len() <= size || size == 0 {
        return values.to_vec();
    }
    let step = values.len().div_ceil(size);
    let last = values.len() - 1;
    let mut subset = vec![values[0]];
    subset.extend(
        (step..values.len().saturating_sub(step))
            .step_by(step)
            .map(|i| values[i]),
    );
    subset.push(values[last]);
    subset
}

/// Status of one section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestStatus {
    /// Sweep ran to completion
    Passed,
    /// Sweep aborted with an error
    Failed,
}

impl TestStatus {
    /// Check if status indicates success
    pub fn is_passed(&self) -> bool {
        matches!(self, TestStatus::Passed)
    }

    /// Get human-readable status string
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Passed => "PASSED",
            TestStatus::Failed => "FAILED",
        }
    }
}

/// Table of sweep results, one column per recorded quantity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultTable {
    /// Table caption
    pub caption: String,
    /// Column headings
    pub headings: Vec<String>,
    /// Unit of each column, shown under its heading
    pub units: Vec<String>,
    /// Full-resolution column data
    pub columns: Vec<Vec<f64>>,
}

impl ResultTable {
    /// Create an empty table
    pub fn new(caption: impl Into<String>) -> Self {
        Self {
            caption: caption.into(),
            headings: Vec::new(),
            units: Vec::new(),
            columns: Vec::new(),
        }
    }

    /// Append a column
    pub fn with_column(
        mut self,
        heading: impl Into<String>,
        unit: impl Into<String>,
        values: Vec<f64>,
    ) -> Self {
        self.headings.push(heading.into());
        self.units.push(unit.into());
        self.columns.push(values);
        self
    }

    /// Number of data rows (length of the longest column)
    pub fn row_count(&self) -> usize {
        self.columns.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Heading combined with its unit, e.g. `Input Power (dBm)`
    pub fn labels(&self) -> Vec<String> {
        self.headings
            .iter()
            .zip(&self.units)
            .map(|(heading, unit)| format!("{} ({})", heading, unit))
            .collect()
    }

    /// Column data by heading
    pub fn column(&self, heading: &str) -> Option<&[f64]> {
        self.headings
            .iter()
            .position(|h| h == heading)
            .map(|i| self.columns[i].as_slice())
    }

    /// Rows as rendered: rounded to 2 decimals and decimated per column
    pub fn display_rows(&self) -> Vec<Vec<f64>> {
        let columns: Vec<Vec<f64>> = self
            .columns
            .iter()
            .map(|c| {
                let rounded: Vec<f64> = c.iter().map(|v| round_to(*v, 2)).collect();
                decimate(&rounded, MAX_TABLE_ROWS)
            })
            .collect();
        let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
        (0..rows)
            .map(|r| columns.iter().map(|c| c[r]).collect())
            .collect()
    }

    fn check_rectangular(&self) -> AppResult<usize> {
        let rows = self.row_count();
        if let Some(i) = self.columns.iter().position(|c| c.len() != rows) {
            return Err(HarnessError::Report(format!(
                "Column '{}' has {} values, expected {}",
                self.headings[i],
                self.columns[i].len(),
                rows
            )));
        }
        Ok(rows)
    }

    /// Full-resolution CSV with a `Heading (unit)` header row
    pub fn to_csv(&self) -> AppResult<String> {
        let rows = self.check_rectangular()?;
        let mut writer = csv::Writer::from_writer(Vec::new());
        let report_err = |e: csv::Error| HarnessError::Report(e.to_string());

        writer.write_record(self.labels()).map_err(report_err)?;
        for r in 0..rows {
            writer
                .write_record(self.columns.iter().map(|c| c[r].to_string()))
                .map_err(report_err)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| HarnessError::Report(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| HarnessError::Report(e.to_string()))
    }

    /// Arrow record batch with one `Float64` field per column
    pub fn to_record_batch(&self) -> AppResult<RecordBatch> {
        self.check_rectangular()?;
        let fields: Vec<Field> = self
            .labels()
            .into_iter()
            .map(|name| Field::new(name, DataType::Float64, false))
            .collect();
        let arrays: Vec<ArrayRef> = self
            .columns
            .iter()
            .map(|c| Arc::new(Float64Array::from(c.clone())) as ArrayRef)
            .collect();
        RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
            .map_err(|e| HarnessError::Report(e.to_string()))
    }

    /// Markdown rendering of [`display_rows`](Self::display_rows)
    pub fn to_markdown(&self) -> String {
        let mut md = format!("**{}**\n\n", self.caption);
        md.push_str(&format!("| {} |\n", self.labels().join(" | ")));
        md.push_str(&format!("|{}\n", "---|".repeat(self.headings.len())));
        for row in self.display_rows() {
            let cells: Vec<String> = row.iter().map(|v| format!("{:.2}", v)).collect();
            md.push_str(&format!("| {} |\n", cells.join(" | ")));
        }
        md
    }
}

/// A plot to draw from one of the section's tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotSpec {
    /// Heading of the column on the x axis
    pub x_column: String,
    /// Heading of the column on the y axis
    pub y_column: String,
    /// X axis label
    pub x_label: String,
    /// Y axis label
    pub y_label: String,
    /// File name stem for the rendered figure
    pub file_stem: String,
}

impl PlotSpec {
    /// Describe a plot of `y_column` against `x_column`
    pub fn new(
        x_column: &str,
        y_column: &str,
        x_label: &str,
        y_label: &str,
        file_stem: &str,
    ) -> Self {
        Self {
            x_column: x_column.to_string(),
            y_column: y_column.to_string(),
            x_label: x_label.to_string(),
            y_label: y_label.to_string(),
            file_stem: file_stem.to_string(),
        }
    }
}

/// Results of one sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSection {
    /// Sweep name, used as the section title
    pub name: String,
    /// Description of what the sweep does
    pub intro: String,
    /// IDs of the devices used
    pub device_names: Vec<String>,
    /// Parameter lines, e.g. `Samples: 10`
    pub parameters: Vec<String>,
    /// Result tables
    pub tables: Vec<ResultTable>,
    /// Plots to draw from the tables
    pub plots: Vec<PlotSpec>,
    /// Outcome
    pub status: TestStatus,
    /// Error message if the sweep failed
    pub error: Option<String>,
    /// Sweep start time
    pub started_at: DateTime<Utc>,
    /// Sweep end time
    pub ended_at: DateTime<Utc>,
    /// Total execution duration
    pub duration: Duration,
}

impl ReportSection {
    /// Start a section now
    pub fn new(name: impl Into<String>, intro: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            intro: intro.into(),
            device_names: Vec::new(),
            parameters: Vec::new(),
            tables: Vec::new(),
            plots: Vec::new(),
            status: TestStatus::Passed,
            error: None,
            started_at: now,
            ended_at: now,
            duration: Duration::ZERO,
        }
    }

    /// Set the devices used
    pub fn with_devices(mut self, device_names: Vec<String>) -> Self {
        self.device_names = device_names;
        self
    }

    /// Add a parameter line
    pub fn with_parameter(mut self, parameter: impl Into<String>) -> Self {
        self.parameters.push(parameter.into());
        self
    }

    /// Add a results table
    pub fn with_table(mut self, table: ResultTable) -> Self {
        self.tables.push(table);
        self
    }

    /// Add a plot description
    pub fn with_plot(mut self, plot: PlotSpec) -> Self {
        self.plots.push(plot);
        self
    }

    /// Mark the section failed with an error message
    pub fn with_error(mut self, error: String) -> Self {
        self.status = TestStatus::Failed;
        self.error = Some(error);
        self
    }

    /// Mark section as completed with given end time
    pub fn mark_completed(mut self, ended_at: DateTime<Utc>) -> Self {
        self.ended_at = ended_at;
        self.duration = ended_at
            .signed_duration_since(self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self
    }

    /// File name stem derived from the section name
    pub fn slug(&self) -> String {
        self.name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect()
    }

    fn to_markdown(&self) -> String {
        let mut md = format!("## {}\n\n", self.name);
        md.push_str(&format!("**Status**: {}\n\n", self.status.as_str()));
        if !self.intro.is_empty() {
            md.push_str(&format!("{}\n\n", self.intro));
        }
        if let Some(error) = &self.error {
            md.push_str(&format!("**Error**: {}\n\n", error));
        }

        if !self.device_names.is_empty() {
            md.push_str("### Devices\n\n");
            for device in &self.device_names {
                md.push_str(&format!("- {}\n", device));
            }
            md.push('\n');
        }

        if !self.parameters.is_empty() {
            md.push_str("### Parameters\n\n");
            for parameter in &self.parameters {
                md.push_str(&format!("- {}\n", parameter));
            }
            md.push('\n');
        }

        for table in &self.tables {
            md.push_str(&table.to_markdown());
            md.push('\n');
        }

        if !self.plots.is_empty() {
            md.push_str("### Plots\n\n");
            for plot in &self.plots {
                md.push_str(&format!(
                    "- `{}`: {} against {}\n",
                    plot.file_stem, plot.y_label, plot.x_label
                ));
            }
            md.push('\n');
        }

        md
    }
}

/// Complete test report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    /// Unique identifier of this run
    pub report_id: Uuid,
    /// Report title
    pub title: String,
    /// Operator or group responsible
    pub author: String,
    /// Report generation timestamp
    pub generated_at: DateTime<Utc>,
    /// One section per sweep
    pub sections: Vec<ReportSection>,
    /// Report notes
    pub notes: Option<String>,
}

impl TestReport {
    /// Create a new test report
    pub fn new(title: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            report_id: Uuid::new_v4(),
            title: title.into(),
            author: author.into(),
            generated_at: Utc::now(),
            sections: Vec::new(),
            notes: None,
        }
    }

    /// Add a section
    pub fn add_section(&mut self, section: ReportSection) {
        self.sections.push(section);
    }

    /// Add report notes
    pub fn with_notes(mut self, notes: String) -> Self {
        self.notes = Some(notes);
        self
    }

    /// Number of sections that passed
    pub fn passed_count(&self) -> usize {
        self.sections.iter().filter(|s| s.status.is_passed()).count()
    }

    /// Number of sections that failed
    pub fn failed_count(&self) -> usize {
        self.sections.len() - self.passed_count()
    }

    /// Export report as JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Export report as markdown
    pub fn to_markdown(&self) -> String {
        let mut md = format!(
            "# {}\n\n**Author**: {}\n**Date**: {}\n**Report ID**: {}\n\n",
            self.title,
            self.author,
            self.generated_at.format("%Y-%m-%d %H:%M:%S"),
            self.report_id
        );

        md.push_str("## Summary\n\n");
        md.push_str(&format!("- **Tests**: {}\n", self.sections.len()));
        md.push_str(&format!("- **Passed**: {}\n", self.passed_count()));
        md.push_str(&format!("- **Failed**: {}\n\n", self.failed_count()));

        for section in &self.sections {
            md.push_str(&section.to_markdown());
        }

        if let Some(notes) = &self.notes {
            md.push_str(&format!("## Notes\n\n{}\n\n", notes));
        }

        md
    }

    /// Write `report.md`, `report.json` and per-table CSV and Arrow files
    ///
    /// Returns the paths written.
    pub fn write_to_dir(&self, dir: &Path) -> AppResult<Vec<PathBuf>> {
        fs::create_dir_all(dir)?;
        let mut written = Vec::new();

        let md_path = dir.join("report.md");
        fs::write(&md_path, self.to_markdown())?;
        written.push(md_path);

        let json_path = dir.join("report.json");
        let json = self
            .to_json()
            .map_err(|e| HarnessError::Report(e.to_string()))?;
        fs::write(&json_path, json)?;
        written.push(json_path);

        for section in &self.sections {
            for (i, table) in section.tables.iter().enumerate() {
                let stem = format!("{}_{}", section.slug(), i);

                let csv_path = dir.join(format!("{}.csv", stem));
                fs::write(&csv_path, table.to_csv()?)?;
                written.push(csv_path);

                let arrow_path = dir.join(format!("{}.arrow", stem));
                write_arrow(&arrow_path, &table.to_record_batch()?)?;
                written.push(arrow_path);
            }
        }

        info!(dir = %dir.display(), files = written.len(), "Report written");
        Ok(written)
    }
}

fn write_arrow(path: &Path, batch: &RecordBatch) -> AppResult<()> {
    let file = fs::File::create(path)?;
    let arrow_err = |e: arrow::error::ArrowError| HarnessError::Report(e.to_string());
    let mut writer = FileWriter::try_new(file, &batch.schema()).map_err(arrow_err)?;
    writer.write(batch).map_err(arrow_err)?;
    writer.finish().map_err(arrow_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn power_table() -> ResultTable {
        ResultTable::new("Beam Power Dependence Results")
            .with_column("Output Power", "dBm", vec![-70.0, -65.0, -60.0])
            .with_column("Input Power", "dBm", vec![-82.004, -77.0, -72.0])
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(1.23456, 2), 1.23);
        assert_eq!(round_to(-82.006, 2), -82.01);
    }

    #[test]
    fn test_decimate_short_input_unchanged() {
        let v: Vec<f64> = (0..20).map(f64::from).collect();
        assert_eq!(decimate(&v, 20), v);
    }

    #[test]
    fn test_decimate_keeps_ends() {
        let v: Vec<f64> = (0..30).map(f64::from).collect();
        let d = decimate(&v, 20);
        assert!(d.len() <= 20);
        assert_eq!(d[0], 0.0);
        assert_eq!(*d.last().unwrap(), 29.0);
        assert_eq!(d[1], 2.0);

        let v: Vec<f64> = (0..1000).map(f64::from).collect();
        let d = decimate(&v, 20);
        assert_eq!(d.len(), 20);
        assert_eq!(d[18], 900.0);
        assert_eq!(*d.last().unwrap(), 999.0);
    }

    #[test]
    fn test_decimate_just_over_limit() {
        let v: Vec<f64> = (0..21).map(f64::from).collect();
        assert_eq!(
            decimate(&v, 20),
            vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0, 12.0, 14.0, 16.0, 18.0, 20.0]
        );
    }

    #[test]
    fn test_table_display_rows() {
        let rows = power_table().display_rows();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], vec![-70.0, -82.0]);
    }

    #[test]
    fn test_table_csv() {
        let csv = power_table().to_csv().unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("Output Power (dBm),Input Power (dBm)"));
        assert_eq!(lines.next(), Some("-70,-82.004"));
    }

    #[test]
    fn test_table_record_batch() {
        let batch = power_table().to_record_batch().unwrap();
        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch.num_columns(), 2);
        assert_eq!(batch.schema().field(1).name(), "Input Power (dBm)");
    }

    #[test]
    fn test_ragged_table_rejected() {
        let table = ResultTable::new("ragged")
            .with_column("X", "mm", vec![1.0, 2.0])
            .with_column("Y", "mm", vec![1.0]);
        assert!(table.to_csv().is_err());
        assert!(table.to_record_batch().is_err());
    }

    #[test]
    fn test_report_markdown() {
        let mut report = TestReport::new("BPM Characterisation", "Diagnostics");
        report.add_section(
            ReportSection::new("Beam Power Dependence", "Sweeps RF power.")
                .with_devices(vec!["Simulated RF Device".to_string()])
                .with_parameter("Samples: 3")
                .with_table(power_table()),
        );
        report.add_section(
            ReportSection::new("Fixed Amplitude Fill Pattern", "")
                .with_error("gate source missing".to_string()),
        );

        let md = report.to_markdown();
        assert!(md.contains("# BPM Characterisation"));
        assert!(md.contains("- **Passed**: 1"));
        assert!(md.contains("- **Failed**: 1"));
        assert!(md.contains("| Output Power (dBm) | Input Power (dBm) |"));
        assert!(md.contains("| -70.00 | -82.00 |"));
        assert!(md.contains("**Error**: gate source missing"));
    }

    #[test]
    fn test_section_slug() {
        let section = ReportSection::new("Beam Power Dependence", "");
        assert_eq!(section.slug(), "beam_power_dependence");
    }
}
