//! Formatting of command results as a terminal table, JSON lines or CSV.

use std::io::Write;
use std::marker::PhantomData;
use std::path::PathBuf;

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Parser, Debug)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write the results to this file instead of standard output.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short = 'f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not create the output file {1:?}")]
    Create(#[source] std::io::Error, PathBuf),
    #[error("could not write to {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write to standard output")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not encode a record as JSON")]
    Json(#[source] serde_json::Error),
}

/// A row of command output.
pub trait Record: serde::Serialize {
    /// Column titles for the table and CSV formats, one per cell.
    const COLUMNS: &'static [&'static str];

    fn cells(&self) -> Vec<String>;
}

impl Args {
    pub fn open<R: Record>(self) -> Result<Output<R>, Error> {
        let sink: Box<dyn Write> = match &self.output {
            None => Box::new(std::io::stdout().lock()),
            Some(path) => Box::new(
                std::fs::File::create(path).map_err(|e| Error::Create(e, path.clone()))?,
            ),
        };
        Output::new(sink, self.format, self.output)
    }
}

enum Layout {
    Table(comfy_table::Table),
    Jsonl,
    Csv,
}

pub struct Output<R> {
    sink: Box<dyn Write>,
    destination: Option<PathBuf>,
    layout: Layout,
    record: PhantomData<fn(&R)>,
}

impl<R: Record> Output<R> {
    fn new(sink: Box<dyn Write>, format: Format, destination: Option<PathBuf>) -> Result<Self, Error> {
        let layout = match format {
            Format::Table => {
                let mut table = comfy_table::Table::new();
                table
                    .set_content_arrangement(comfy_table::ContentArrangement::Dynamic)
                    .set_header(R::COLUMNS.to_vec());
                Layout::Table(table)
            }
            Format::Jsonl => Layout::Jsonl,
            Format::Csv => Layout::Csv,
        };
        let mut output = Self { sink, destination, layout, record: PhantomData };
        if let Layout::Csv = output.layout {
            output.csv_line(R::COLUMNS)?;
        }
        Ok(output)
    }

    fn io_error(&self, e: std::io::Error) -> Error {
        match &self.destination {
            Some(path) => Error::WriteFile(e, path.clone()),
            None => Error::WriteStdout(e),
        }
    }

    fn csv_line<S: AsRef<str>>(&mut self, cells: &[S]) -> Result<(), Error> {
        let mut writer = csv_core::Writer::new();
        let mut line = Vec::new();
        // A field at most doubles in size once quotes are escaped and added around it.
        let widest = cells.iter().map(|c| c.as_ref().len()).max().unwrap_or(0);
        let mut buffer = vec![0; 2 * widest + 2];
        for (index, cell) in cells.iter().enumerate() {
            if index != 0 {
                let (_, n) = writer.delimiter(&mut buffer);
                line.extend_from_slice(&buffer[..n]);
            }
            let mut input = cell.as_ref().as_bytes();
            loop {
                let (result, consumed, n) = writer.field(input, &mut buffer);
                line.extend_from_slice(&buffer[..n]);
                input = &input[consumed..];
                if let csv_core::WriteResult::InputEmpty = result {
                    break;
                }
            }
        }
        let (_, n) = writer.terminator(&mut buffer);
        line.extend_from_slice(&buffer[..n]);
        self.sink.write_all(&line).map_err(|e| self.io_error(e))
    }

    pub fn emit(&mut self, record: &R) -> Result<(), Error> {
        match self.layout {
            Layout::Table(ref mut table) => {
                table.add_row(record.cells());
                Ok(())
            }
            Layout::Csv => self.csv_line(&record.cells()),
            Layout::Jsonl => {
                let mut line = serde_json::to_vec(record).map_err(Error::Json)?;
                line.push(b'\n');
                self.sink.write_all(&line).map_err(|e| self.io_error(e))
            }
        }
    }

    /// Write out anything still buffered, the whole table for the table format.
    pub fn finish(mut self) -> Result<(), Error> {
        if let Layout::Table(table) = &self.layout {
            let rendered = format!("{table}\n");
            self.sink.write_all(rendered.as_bytes()).map_err(|e| self.io_error(e))?;
        }
        self.sink.flush().map_err(|e| self.io_error(e))
    }
}
