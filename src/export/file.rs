use std::{
    fs::OpenOptions,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use chrono::Utc;

use crate::{Error, Result};

use super::{Exporter, Record};

/// Layout of exported report files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    /// `;`-separated values, one record per line.
    #[default]
    Csv,
    /// One JSON object per line.
    Json,
}

impl ReportFormat {
    fn extension(self) -> &'static str {
        match self {
            ReportFormat::Csv => "csv",
            ReportFormat::Json => "json",
        }
    }
}

impl FromStr for ReportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<ReportFormat> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ReportFormat::Csv),
            "json" => Ok(ReportFormat::Json),
            other => Err(Error::InvalidConfiguration(format!(
                "unsupported report format '{other}'"
            ))),
        }
    }
}

/// Appends each batch to `flag-evaluation-<unix seconds>.<ext>` in a directory.
#[derive(Debug, Clone)]
pub struct FileExporter {
    dir: PathBuf,
    format: ReportFormat,
}

impl FileExporter {
    pub fn new(dir: impl AsRef<Path>, format: ReportFormat) -> Result<FileExporter> {
        let dir = dir.as_ref();
        if dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfiguration(
                "file exporter requires a directory".to_owned(),
            ));
        }
        Ok(FileExporter {
            dir: dir.to_owned(),
            format,
        })
    }

    fn filename(&self) -> String {
        format!(
            "flag-evaluation-{}.{}",
            Utc::now().timestamp(),
            self.format.extension()
        )
    }
}

fn csv_line(record: &Record) -> String {
    let value = match &record.value {
        None => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(value) => value.to_string(),
    };
    format!(
        "{};{};{};{};{};{};{}\n",
        record.creation_date,
        record.key,
        value,
        record.variant.as_deref().unwrap_or_default(),
        record.reason.as_deref().unwrap_or_default(),
        record.error_code.as_deref().unwrap_or_default(),
        record.error_message.as_deref().unwrap_or_default(),
    )
}

impl Exporter for FileExporter {
    fn export(&self, records: &[Record]) -> Result<()> {
        let path = self.dir.join(self.filename());
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);

        for record in records {
            match self.format {
                ReportFormat::Csv => writer.write_all(csv_line(record).as_bytes())?,
                ReportFormat::Json => {
                    serde_json::to_writer(&mut writer, record)?;
                    writer.write_all(b"\n")?;
                }
            }
        }
        writer.flush()?;

        log::debug!(target: "flagserve", "wrote {} records to {}", records.len(), path.display());
        Ok(())
    }
}
