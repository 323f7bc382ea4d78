use csv_core::WriteResult;
use std::path::PathBuf;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write to this file instead of the standard output.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short = 'f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the specified output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize a record to JSON")]
    SerializeJson(#[source] serde_json::Error),
    #[error("could not encode a CSV field")]
    EncodeCsv,
}

/// Something that can be shown as a table row as well as serialized on its own.
pub trait Record: serde::Serialize {
    fn headers() -> &'static [&'static str];
    fn cells(&self) -> Vec<String>;
}

impl Args {
    pub fn new(format: Format) -> Self {
        Self { output: None, format }
    }

    pub fn to_output(self) -> Result<Output, Error> {
        let io = match &self.output {
            None => Box::new(std::io::stdout().lock()) as Box<dyn std::io::Write>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ),
        };
        Ok(Output::new(self, io))
    }
}

pub struct Output {
    args: Args,
    io: Box<dyn std::io::Write>,
    formatter: Formatter,
}

enum Formatter {
    Csv { wrote_headers: bool },
    Table { comfy: comfy_table::Table, has_rows: bool },
    Jsonl,
}

impl Output {
    pub fn new(args: Args, io: Box<dyn std::io::Write>) -> Self {
        let formatter = match args.format {
            Format::Table => {
                let mut comfy = comfy_table::Table::new();
                comfy.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                Formatter::Table { comfy, has_rows: false }
            }
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv { wrote_headers: false },
        };
        Self { args, io, formatter }
    }

    pub fn record<R: Record>(&mut self, record: &R) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { wrote_headers } => {
                if !std::mem::replace(wrote_headers, true) {
                    self.write_csv_row(R::headers())?;
                }
                self.write_csv_row(&record.cells())?;
            }
            Formatter::Table { comfy, has_rows } => {
                if !std::mem::replace(has_rows, true) {
                    comfy.set_header(R::headers().to_vec());
                }
                comfy.add_row(record.cells());
            }
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, record).map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))?;
            }
        }
        Ok(())
    }

    fn write_csv_row<V: AsRef<str>>(&mut self, values: &[V]) -> Result<(), Error> {
        let max_len = 2 + 2 * values.iter().map(|v| v.as_ref().len()).max().unwrap_or(0);
        let mut output = vec![0; max_len];
        let mut line = Vec::new();
        let mut writer = csv_core::Writer::new();
        for (idx, value) in values.iter().enumerate() {
            if idx != 0 {
                let (WriteResult::InputEmpty, n) = writer.delimiter(&mut output) else {
                    return Err(Error::EncodeCsv);
                };
                line.extend_from_slice(&output[..n]);
            }
            let input = value.as_ref().as_bytes();
            let (WriteResult::InputEmpty, read, n) = writer.field(input, &mut output) else {
                return Err(Error::EncodeCsv);
            };
            if read != input.len() {
                return Err(Error::EncodeCsv);
            }
            line.extend_from_slice(&output[..n]);
        }
        let (WriteResult::InputEmpty, n) = writer.terminator(&mut output) else {
            return Err(Error::EncodeCsv);
        };
        line.extend_from_slice(&output[..n]);
        self.io.write_all(&line).map_err(|e| self.write_error(e))
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.args.output {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.clone()),
        }
    }

    pub fn commit(mut self) -> Result<(), Error> {
        if let Formatter::Table { comfy, has_rows } = &self.formatter {
            if *has_rows {
                writeln!(self.io, "{comfy}").map_err(|e| self.write_error(e))?;
            }
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }
}
